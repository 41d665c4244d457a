//! Established streams carrying I2P addressing
//!
//! [`I2pStream`] passes reads and writes straight through to the connection
//! underneath while reporting the negotiated I2P addresses instead of the
//! local TCP ones. Bytes that arrived together with the peer preamble are
//! replayed before anything else is read from the connection.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use i2pbridge_protocol::{I2pAddress, Parsed, PeerLine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::bob::client::TunnelGuard;
use crate::error::{BridgeError, Result};
use crate::session::StreamRegistration;
use crate::transport::ControlStream;

/// Keeps whatever owns the stream's resources alive until the stream is dropped
#[derive(Default)]
pub(crate) enum StreamGuard {
    #[default]
    None,

    /// Registered with a SAM session
    Session { _registration: StreamRegistration },

    /// Rides on a BOB tunnel this process created
    Tunnel { _tunnel: TunnelGuard },
}

/// Read the peer preamble from the front of `stream`.
///
/// `buffer` may already hold bytes read earlier; whatever follows the
/// preamble is left in it.
pub(crate) async fn read_peer_line<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<PeerLine>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Parsed::Complete { value, consumed } = PeerLine::parse(&buffer[..])? {
            buffer.advance(consumed);
            return Ok(value);
        }

        if stream.read_buf(buffer).await? == 0 {
            return Err(BridgeError::Connection(io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

/// A byte stream to an I2P peer
pub struct I2pStream {
    inner: Box<dyn ControlStream>,
    prefix: BytesMut,
    local: I2pAddress,
    peer: I2pAddress,
    guard: StreamGuard,
}

impl I2pStream {
    pub(crate) fn new(
        inner: Box<dyn ControlStream>,
        prefix: BytesMut,
        local: I2pAddress,
        peer: I2pAddress,
        guard: StreamGuard,
    ) -> Self {
        Self {
            inner,
            prefix,
            local,
            peer,
            guard,
        }
    }

    /// Our own I2P address
    pub fn local_addr(&self) -> &I2pAddress {
        &self.local
    }

    /// The remote peer's I2P address
    pub fn peer_addr(&self) -> &I2pAddress {
        &self.peer
    }

    /// Whether the stream keeps a SAM session registration alive
    pub fn is_session_stream(&self) -> bool {
        matches!(self.guard, StreamGuard::Session { .. })
    }
}

impl fmt::Debug for I2pStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2pStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("buffered", &self.prefix.len())
            .finish()
    }
}

impl AsyncRead for I2pStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for I2pStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
