//! Listeners the server loop can accept connections from.

use std::io;

use async_trait::async_trait;

use crate::conn::Transport;

/// Source of incoming transports.
#[async_trait]
pub trait Listener: Send + Sync {
    type Io: Transport;

    /// Wait for the next connection. Returns the transport and a printable
    /// peer address.
    async fn accept(&self) -> io::Result<(Self::Io, String)>;
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    type Io = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Io, String)> {
        let (stream, peer) = tokio::net::TcpListener::accept(self).await?;
        // Small frames dominate; don't let Nagle hold them back.
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<(Self::Io, String)> {
        let (stream, peer) = tokio::net::UnixListener::accept(self).await?;
        let peer = peer
            .as_pathname()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unix:unnamed".to_string());
        Ok((stream, peer))
    }
}
