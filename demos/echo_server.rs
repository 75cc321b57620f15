//! Runs the reference echo backend until Ctrl+C.
//!
//! Usage: cargo run --example echo_server -- [--address 127.0.0.1:3000] [--debug]

mod common;

use std::net::SocketAddr;

use linepool::EchoServer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = common::Args::parse();
    common::init_logging(args.debug);

    let addr: SocketAddr = args.address.parse()?;
    let server = EchoServer::bind(addr.ip(), addr.port()).await?;
    info!(address = %server.address(), "Serving, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    info!(accepted = server.accepted_count(), "Stopped");
    Ok(())
}
