//! Dialing and socket setup.
//!
//! Every pooled connection is dialed through [`dial`], which bounds the
//! connect by the configured timeout and then applies the socket options:
//!
//! - `TCP_NODELAY` on
//! - `SO_LINGER` 0, so close drops the socket immediately
//! - keep-alive probing off unless an interval is configured

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::options::PoolOptions;

// ============================================================================
// Dial
// ============================================================================

/// Connects to `options.address` and configures the socket.
///
/// # Errors
///
/// - [`Error::DialTimeout`] if the connect exceeds `dial_timeout`
/// - [`Error::Dial`] if the connect fails
/// - [`Error::Io`] if a socket option cannot be applied
pub(crate) async fn dial(options: &PoolOptions) -> Result<TcpStream> {
    let address = options.address.as_str();

    let stream = match timeout(options.dial_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::dial(address, e)),
        Err(_) => {
            return Err(Error::dial_timeout(address, options.dial_timeout));
        }
    };

    // The stream is dropped (and closed) if configuration fails.
    configure(&stream, options.keep_alive)?;

    debug!(address, "Dialed backend");
    Ok(stream)
}

/// Applies linger, nodelay and keep-alive settings.
fn configure(stream: &TcpStream, keep_alive: Option<Duration>) -> Result<()> {
    stream.set_nodelay(true)?;

    let socket = SockRef::from(stream);
    socket.set_linger(Some(Duration::ZERO))?;

    match keep_alive {
        Some(interval) => {
            let params = TcpKeepalive::new().with_time(interval);
            socket.set_tcp_keepalive(&params)?;
            trace!(?interval, "Keep-alive enabled");
        }
        None => socket.set_keepalive(false)?,
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        (listener, address)
    }

    #[tokio::test]
    async fn test_dial_applies_socket_options() {
        let (_listener, address) = listener().await;
        let stream = dial(&PoolOptions::new(address)).await.expect("dial");

        let socket = SockRef::from(&stream);
        assert_eq!(socket.linger().expect("linger"), Some(Duration::ZERO));
        assert!(!socket.keepalive().expect("keepalive"));
        assert!(stream.nodelay().expect("nodelay"));
    }

    #[tokio::test]
    async fn test_dial_enables_keep_alive_when_configured() {
        let (_listener, address) = listener().await;
        let options = PoolOptions::new(address).with_keep_alive(Duration::from_secs(30));
        let stream = dial(&options).await.expect("dial");

        assert!(SockRef::from(&stream).keepalive().expect("keepalive"));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let (listener, address) = listener().await;
        drop(listener);

        let err = dial(&PoolOptions::new(address.clone())).await.unwrap_err();
        match err {
            Error::Dial { address: dialed, .. } => assert_eq!(dialed, address),
            other => panic!("expected dial error, got {other:?}"),
        }
    }
}
