//! Session control connection
//!
//! Once a session is established its control connection only carries
//! keepalive traffic. The task here owns that connection for the lifetime of
//! the session: it answers router pings, sends its own on SAM 3.2+, and
//! closes the session when the connection dies.

use std::sync::Weak;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use i2pbridge_protocol::line::{line_str, next_line};
use i2pbridge_protocol::{SamReply, SamVersion};
use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::config::KeepaliveConfig;
use crate::keepalive::{KeepaliveEvent, KeepaliveTimer};
use crate::sam::sender::SamSender;
use crate::session::Session;
use crate::transport::ControlStream;

const LOG_TARGET: &str = "i2pbridge::sam::control";

/// Start supervising a session's control connection.
///
/// The returned sender stops the task and drops the connection.
pub(crate) fn spawn_control(
    stream: Box<dyn ControlStream>,
    buffer: BytesMut,
    version: &SamVersion,
    keepalive: &KeepaliveConfig,
    session: Weak<Session>,
) -> oneshot::Sender<()> {
    let timer = if version.at_least(3, 2) {
        Some(KeepaliveTimer::new(keepalive.interval(), keepalive.timeout()))
    } else {
        if let Err(e) = stream.set_keepalive(keepalive.interval()) {
            debug!(target: LOG_TARGET, "transport keep-alive unavailable: {}", e);
        }
        None
    };

    let (tx, rx) = oneshot::channel();
    tokio::spawn(
        ControlTask {
            stream,
            buffer,
            timer,
            sender: SamSender::new(),
        }
        .run(rx, session),
    );
    tx
}

struct ControlTask {
    stream: Box<dyn ControlStream>,
    buffer: BytesMut,
    timer: Option<KeepaliveTimer>,
    sender: SamSender,
}

async fn next_keepalive(timer: &mut Option<KeepaliveTimer>) -> KeepaliveEvent {
    match timer {
        Some(timer) => timer.next().await,
        None => std::future::pending().await,
    }
}

fn ping_token() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
        .to_string()
}

impl ControlTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>, session: Weak<Session>) {
        self.process_lines();
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(target: LOG_TARGET, "control connection shut down");
                    let _ = self.stream.shutdown().await;
                    return;
                }
                event = next_keepalive(&mut self.timer) => match event {
                    KeepaliveEvent::Ping => self.sender.ping(Some(&ping_token())),
                    KeepaliveEvent::Expired => {
                        warn!(target: LOG_TARGET, "no keepalive from router, dropping session");
                        break;
                    }
                },
                read = self.stream.read_buf(&mut self.buffer) => match read {
                    Ok(0) => {
                        debug!(target: LOG_TARGET, "router closed the control connection");
                        break;
                    }
                    Ok(_) => self.process_lines(),
                    Err(e) => {
                        warn!(target: LOG_TARGET, "control connection failed: {}", e);
                        break;
                    }
                },
            }

            let out = self.sender.take();
            if !out.is_empty() {
                if let Err(e) = self.stream.write_all(&out).await {
                    warn!(target: LOG_TARGET, "keepalive write failed: {}", e);
                    break;
                }
            }
        }

        if let Some(session) = session.upgrade() {
            session.connection_lost();
        }
    }

    fn process_lines(&mut self) {
        while let Some((line, consumed)) = next_line(&self.buffer, 0) {
            match line_str(line).map(SamReply::parse_line) {
                Ok(Ok(SamReply::Ping(token))) => {
                    trace!(target: LOG_TARGET, "<- PING {:?}", token);
                    self.sender.pong(token.as_deref());
                    self.touch();
                }
                Ok(Ok(SamReply::Pong(token))) => {
                    trace!(target: LOG_TARGET, "<- PONG {:?}", token);
                    self.touch();
                }
                Ok(Ok(reply)) => debug!(target: LOG_TARGET, "ignoring {:?}", reply),
                Ok(Err(e)) | Err(e) => warn!(target: LOG_TARGET, "unparseable control line: {}", e),
            }
            self.buffer.advance(consumed);
        }
    }

    fn touch(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionParams, SessionRegistry};
    use crate::sam::sender::SessionStyle;
    use i2pbridge_protocol::I2pAddress;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn session(registry: &Arc<SessionRegistry>) -> Arc<Session> {
        Arc::new(Session::new(
            SessionParams {
                nickname: "spam".to_string(),
                version: SamVersion::new(3, 2),
                style: SessionStyle::Stream,
                address: I2pAddress::new("spam", None),
                private_key: "privkey".to_string(),
                auto_close: false,
            },
            Arc::downgrade(registry),
        ))
    }

    fn keepalive() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_secs: 60,
            timeout_secs: 120,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_ping_and_expires() {
        let registry = SessionRegistry::new();
        let session = session(&registry);
        let (client, server) = tokio::io::duplex(256);

        let shutdown = spawn_control(
            Box::new(client),
            BytesMut::new(),
            &SamVersion::new(3, 2),
            &keepalive(),
            Arc::downgrade(&session),
        );
        session.attach_control(shutdown);

        let (read, mut write) = tokio::io::split(server);
        let mut read = BufReader::new(read);
        write.write_all(b"PING 7\n").await.unwrap();

        let mut line = String::new();
        read.read_line(&mut line).await.unwrap();
        assert_eq!(line, "PONG 7\n");

        line.clear();
        read.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("PING "));

        // the router went quiet after its ping at t=0
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_router_hangup_closes_session() {
        let registry = SessionRegistry::new();
        let session = session(&registry);
        let (client, server) = tokio::io::duplex(256);

        let shutdown = spawn_control(
            Box::new(client),
            BytesMut::new(),
            &SamVersion::new(3, 0),
            &keepalive(),
            Arc::downgrade(&session),
        );
        session.attach_control(shutdown);

        drop(server);
        while !session.is_closed() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_close_stops_task() {
        let registry = SessionRegistry::new();
        let session = session(&registry);
        let (client, mut server) = tokio::io::duplex(256);

        let shutdown = spawn_control(
            Box::new(client),
            BytesMut::new(),
            &SamVersion::new(3, 1),
            &keepalive(),
            Arc::downgrade(&session),
        );
        session.attach_control(shutdown);
        session.close().unwrap();

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
