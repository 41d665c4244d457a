//! In-memory router for integration tests
//!
//! Every `connect()` opens a duplex pipe and hands the router end to the
//! test, which then plays the router's side of the conversation.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use i2pbridge_client::{Connector, ControlStream};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

pub struct PipeConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    connects: AtomicUsize,
    attempts: AtomicUsize,
    refusing: AtomicBool,
}

impl PipeConnector {
    /// Connections handed to the router side
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every call to `connect`, refused or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse all further connections without waiting
    pub fn refuse(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self) -> io::Result<Box<dyn ControlStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }

        let (client, router) = tokio::io::duplex(4096);
        self.tx
            .send(router)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "router gone"))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(client))
    }
}

/// Connector plus the queue of router ends it produces
pub fn pipe() -> (Arc<PipeConnector>, Routers) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(PipeConnector {
        tx,
        connects: AtomicUsize::new(0),
        attempts: AtomicUsize::new(0),
        refusing: AtomicBool::new(false),
    });
    (connector, Routers { rx })
}

pub struct Routers {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Routers {
    /// Router side of the next control connection
    pub async fn next(&mut self) -> Router {
        let stream = self.rx.recv().await.expect("connector dropped");
        Router::new(stream)
    }

    pub fn is_idle(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

/// Scripted router end of one control connection
pub struct Router {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Router {
    pub fn new(stream: DuplexStream) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Assert the client sends exactly `line` next
    pub async fn expect(&mut self, line: &str) {
        assert_eq!(self.read_line().await, line);
    }

    pub async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Expect `line`, answer with `reply`
    pub async fn exchange(&mut self, line: &str, reply: &str) {
        self.expect(line).await;
        self.send(reply).await;
    }

    /// Read whatever arrives until the client hangs up
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.reader.read_to_end(&mut rest).await.unwrap();
        rest
    }

    pub fn into_inner(self) -> DuplexStream {
        self.reader.into_inner().unsplit(self.writer)
    }
}
