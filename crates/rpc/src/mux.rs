//! Protocol multiplexing: one listener, two logical protocols.
//!
//! The server peeks the first bytes of each accepted connection. Connections
//! leading with [`PROTOCOL_HEADER`](crate::protocol::PROTOCOL_HEADER) go to
//! the native RPC path with the header consumed; everything else goes to the
//! HTTP server with the peeked bytes replayed in front of the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::PROTOCOL_HEADER;
use crate::stream::BoxIo;

/// A connection with already-consumed bytes replayed ahead of the socket.
pub struct PrefixedIo {
    prefix: Bytes,
    inner: BoxIo,
}

impl PrefixedIo {
    pub(crate) fn new(prefix: Bytes, inner: BoxIo) -> Self {
        Self { prefix, inner }
    }

    /// A connection with nothing to replay.
    pub(crate) fn bare(inner: BoxIo) -> Self {
        Self::new(Bytes::new(), inner)
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = buf.remaining().min(self.prefix.len());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Where the demultiplexer routed a sniffed connection.
pub(crate) enum Routed {
    /// Native RPC; the protocol header has been consumed.
    Rpc(PrefixedIo),
    /// Anything else; sniffed bytes are replayed.
    Http(PrefixedIo),
}

/// Peek the protocol-selection header off a fresh connection.
///
/// Returns `None` when the connection dies mid-sniff or the server is
/// shutting down.
pub(crate) async fn sniff(mut io: BoxIo, token: &CancellationToken) -> Option<Routed> {
    let mut header = [0u8; PROTOCOL_HEADER.len()];
    let mut filled = 0;

    while filled < header.len() {
        tokio::select! {
            () = token.cancelled() => return None,
            read = io.read(&mut header[filled..]) => match read {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    debug!(error = %e, "connection died during protocol sniff");
                    return None;
                }
            }
        }
    }

    if filled == header.len() && header == PROTOCOL_HEADER {
        Some(Routed::Rpc(PrefixedIo::bare(io)))
    } else {
        Some(Routed::Http(PrefixedIo::new(
            Bytes::copy_from_slice(&header[..filled]),
            io,
        )))
    }
}

/// Address label reported for mux'd HTTP connections.
#[derive(Debug, Clone)]
pub struct ListenAddr(pub(crate) String);

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The HTTP side of the demultiplexer, served with `axum::serve`.
pub(crate) struct HttpSideListener {
    connections: mpsc::Receiver<PrefixedIo>,
    addr: ListenAddr,
}

impl HttpSideListener {
    pub(crate) const fn new(connections: mpsc::Receiver<PrefixedIo>, addr: ListenAddr) -> Self {
        Self { connections, addr }
    }
}

impl axum::serve::Listener for HttpSideListener {
    type Io = PrefixedIo;
    type Addr = ListenAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.connections.recv().await {
            Some(io) => (io, self.addr.clone()),
            // The demux driver has stopped; park until graceful shutdown.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.addr.clone())
    }
}
