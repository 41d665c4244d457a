//! Drives a negotiation state machine over a control connection
//!
//! State machines are sans-IO: they tokenize buffered bytes, react to one
//! reply at a time and queue outgoing command lines. [`Connection`] owns the
//! stream plus the receive buffer and shuttles bytes between the two.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use i2pbridge_protocol::Parsed;
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{BridgeError, Result};
use crate::transport::ControlStream;

const LOG_TARGET: &str = "i2pbridge::driver";

/// Outcome of handling one reply
#[derive(Debug, PartialEq, Eq)]
pub enum Progress<T> {
    /// More replies are needed
    Continue,

    /// The negotiation reached its terminal state
    Done(T),
}

/// A single command/reply exchange with the router
pub trait Negotiation {
    type Reply;
    type Output;

    /// Tokenize the next reply expected in the current state
    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<Self::Reply>>;

    /// React to one reply, possibly queueing the next command
    fn handle(&mut self, reply: Self::Reply) -> Result<Progress<Self::Output>>;

    /// Drain queued command bytes
    fn outgoing(&mut self) -> Bytes;

    /// Output to yield if the router closes the connection, if the
    /// current state tolerates that
    fn on_eof(&mut self) -> Option<Self::Output> {
        None
    }
}

/// An open control connection and the bytes received but not yet consumed
pub struct Connection {
    stream: Box<dyn ControlStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: Box<dyn ControlStream>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Run `negotiation` until it reaches a terminal state.
    ///
    /// Bytes following the terminal reply stay buffered.
    pub async fn drive<N: Negotiation>(&mut self, negotiation: &mut N) -> Result<N::Output> {
        loop {
            self.flush(negotiation).await?;

            match negotiation.parse(&self.buffer)? {
                Parsed::Complete { value, consumed } => {
                    self.buffer.advance(consumed);
                    if let Progress::Done(output) = negotiation.handle(value)? {
                        self.flush(negotiation).await?;
                        return Ok(output);
                    }
                }
                Parsed::Incomplete => {
                    if self.stream.read_buf(&mut self.buffer).await? == 0 {
                        return negotiation.on_eof().ok_or_else(|| {
                            BridgeError::Connection(std::io::ErrorKind::UnexpectedEof.into())
                        });
                    }
                }
            }
        }
    }

    /// [`Connection::drive`] bounded by `limit`
    pub async fn drive_for<N: Negotiation>(
        &mut self,
        negotiation: &mut N,
        limit: Duration,
    ) -> Result<N::Output> {
        tokio::time::timeout(limit, self.drive(negotiation))
            .await
            .map_err(|_| BridgeError::Timeout)?
    }

    async fn flush<N: Negotiation>(&mut self, negotiation: &mut N) -> Result<()> {
        let out = negotiation.outgoing();
        if !out.is_empty() {
            trace!(target: LOG_TARGET, "-> {:?}", String::from_utf8_lossy(&out));
            self.stream.write_all(&out).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    pub fn stream(&self) -> &dyn ControlStream {
        &*self.stream
    }

    /// Split into the stream and any unconsumed bytes
    pub fn into_parts(self) -> (Box<dyn ControlStream>, BytesMut) {
        (self.stream, self.buffer)
    }
}
