//! TCP endpoints.
//!
//! The sync core is generic over any ordered byte stream; this module is
//! the only place that knows about sockets.

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

/// Bind `:<port>` and accept exactly one connection. The protocol has no
/// session resumption, so there is nothing useful to do with a second
/// client.
pub async fn listen_one(port: u16) -> Result<TcpStream> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(port, "listening");

    let (stream, peer) = listener
        .accept()
        .await
        .context("failed to accept connection")?;
    info!(%peer, "client connected");
    Ok(stream)
}

/// Connect to a server at `host:port`.
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!(addr, "connected");
    Ok(stream)
}
