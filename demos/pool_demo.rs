//! Sends concurrent requests through a shared pool.
//!
//! Starts an in-process echo backend unless `--address` is given, then
//! spawns `--requests` tasks that each check a connection out, send one
//! request, return the connection and print the reply.
//!
//! Usage: cargo run --example pool_demo -- [--size 5] [--requests 10] [--debug]

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use linepool::{EchoServer, Pool, PoolOptions, Request};
use tracing::{info, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = common::Args::parse();
    common::init_logging(args.debug);

    let explicit = std::env::args().any(|a| a == "--address");
    let server = if explicit {
        None
    } else {
        Some(EchoServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?)
    };
    let address = server
        .as_ref()
        .map_or_else(|| args.address.clone(), EchoServer::address);

    let options = PoolOptions::new(address)
        .with_pool_size(args.size)
        .with_dial_timeout(Duration::from_secs(5));
    let pool = Arc::new(Pool::new(options).await?);

    let tasks: Vec<_> = (0..args.requests)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { send_in_pool(&pool, format!("Uid-{i}")).await })
        })
        .collect();

    for task in tasks {
        if let Err(e) = task.await? {
            warn!(error = %e, "Send in pool failed");
        }
    }

    info!(
        idle = pool.idle_count(),
        active = pool.active_count(),
        "All requests finished"
    );
    pool.close().await?;
    Ok(())
}

async fn send_in_pool(pool: &Pool, id: String) -> linepool::Result<()> {
    let conn = pool.get().await?;

    let handle = match conn.send(&Request::new(id.clone(), "pixelpig!")).await {
        Ok(handle) => handle,
        Err(e) => {
            pool.put(conn, Some(&e)).await;
            return Err(e);
        }
    };

    match handle.timeout(REPLY_TIMEOUT).await {
        Ok(reply) => {
            pool.put(conn, None).await;
            info!(%id, %reply, "Reply");
            Ok(())
        }
        Err(e) => {
            pool.put(conn, Some(&e)).await;
            Err(e)
        }
    }
}
