//! Control connection transport
//!
//! Negotiations only need a byte stream to the router. [`Connector`] opens
//! one; production code uses [`TcpConnector`], tests plug in in-memory pipes.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A byte stream carrying one control negotiation
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Enable transport-level keep-alive probes.
    ///
    /// Used by SAM sessions whose router predates `PING`/`PONG`.
    fn set_keepalive(&self, _idle: Duration) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport has no keep-alive support",
        ))
    }
}

impl ControlStream for TcpStream {
    fn set_keepalive(&self, idle: Duration) -> io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(idle);
        SockRef::from(self).set_tcp_keepalive(&keepalive)
    }
}

impl ControlStream for DuplexStream {}

impl<T: ControlStream + ?Sized> ControlStream for Box<T> {
    fn set_keepalive(&self, idle: Duration) -> io::Result<()> {
        (**self).set_keepalive(idle)
    }
}

/// Opens control connections to a router
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn ControlStream>>;
}

/// Connects to the router over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn ControlStream>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.address),
                )
            })??;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}
