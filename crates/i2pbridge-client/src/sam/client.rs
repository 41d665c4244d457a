//! SAM client
//!
//! Sessions are shared per nickname through a [`SessionRegistry`]; every
//! stream opens its own control connection to the router.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use i2pbridge_protocol::{I2pAddress, SamVersion};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::allocator::default_nickname;
use crate::config::{BridgeConfig, KeepaliveConfig};
use crate::driver::{Connection, Negotiation};
use crate::error::{BridgeError, Result};
use crate::keyfile;
use crate::sam::control::spawn_control;
use crate::sam::receiver::{
    ApiProbe, ConnectTarget, DestGenerator, NameLookup, SessionCreator, SessionRequest,
    StreamCommand, StreamConnector, StreamMode, VersionRange,
};
use crate::sam::sender::SessionStyle;
use crate::session::{Session, SessionParams, SessionRegistry};
use crate::transport::{Connector, TcpConnector};
use crate::wrapper::{read_peer_line, I2pStream, StreamGuard};

const LOG_TARGET: &str = "i2pbridge::sam";

/// How to acquire a session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Registry key; defaults to `<prefix>-<pid>`
    pub nickname: Option<String>,
    pub style: SessionStyle,

    /// Private key source. Created with the router-assigned key when absent.
    pub keyfile: Option<PathBuf>,

    /// I2P port the session's streams originate from
    pub local_port: Option<u16>,

    /// Close the session once its last stream goes away
    pub auto_close: bool,

    /// I2CP options passed through to `SESSION CREATE`
    pub options: Vec<(String, String)>,

    /// Overrides the configured signature type
    pub signature_type: Option<String>,
}

/// Invoked for every inbound stream a listener receives
pub type StreamHandler = Arc<dyn Fn(I2pStream) + Send + Sync>;

/// Client for the SAM bridge
#[derive(Clone)]
pub struct SamClient {
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    versions: VersionRange,
    signature_type: Option<String>,
    keepalive: KeepaliveConfig,
    negotiation_timeout: Duration,
    nickname_prefix: String,
}

impl SamClient {
    pub fn new(connector: Arc<dyn Connector>, config: &BridgeConfig) -> Self {
        Self {
            connector,
            registry: SessionRegistry::new(),
            versions: VersionRange {
                min: config.sam.min_version.clone(),
                max: config.sam.max_version.clone(),
            },
            signature_type: config.sam.signature_type.clone(),
            keepalive: config.keepalive.clone(),
            negotiation_timeout: config.timeouts.negotiation(),
            nickname_prefix: config.nickname_prefix.clone(),
        }
    }

    /// Client talking to the configured SAM address over TCP
    pub fn tcp(config: &BridgeConfig) -> Self {
        let connector = TcpConnector::new(config.sam.address.clone(), config.timeouts.connect());
        Self::new(Arc::new(connector), config)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn negotiate<N: Negotiation>(&self, mut machine: N) -> Result<(N::Output, Connection)> {
        let stream = self.connector.connect().await?;
        let mut connection = Connection::new(stream);
        let output = connection
            .drive_for(&mut machine, self.negotiation_timeout)
            .await?;
        Ok((output, connection))
    }

    /// Check the bridge is reachable; returns the negotiated version
    pub async fn test_api(&self) -> Result<SamVersion> {
        let (version, _) = self.negotiate(ApiProbe::new(&self.versions)).await?;
        Ok(version)
    }

    /// Resolve a hostname to its destination
    pub async fn lookup(&self, name: &str) -> Result<I2pAddress> {
        let (destination, _) = self.negotiate(NameLookup::new(name, &self.versions)).await?;
        Ok(I2pAddress::with_host(destination, name, None))
    }

    /// Generate a destination and store its private key in a new `keyfile`
    pub async fn generate_destination(
        &self,
        keyfile: &Path,
        signature_type: Option<String>,
    ) -> Result<I2pAddress> {
        if keyfile::exists(keyfile).await? {
            return Err(BridgeError::KeyfileExists(keyfile.to_path_buf()));
        }

        let signature_type = signature_type.or_else(|| self.signature_type.clone());
        let (keys, _) = self
            .negotiate(DestGenerator::new(signature_type, &self.versions))
            .await?;

        keyfile::write_new(keyfile, &keys.private).await?;
        info!(target: LOG_TARGET, "wrote new destination to {}", keyfile.display());
        Ok(I2pAddress::new(keys.public, None))
    }

    /// Return the session for `options.nickname`, creating it if needed.
    ///
    /// Concurrent calls for one nickname share a single negotiation.
    pub async fn session(&self, options: SessionOptions) -> Result<Arc<Session>> {
        if options.style != SessionStyle::Stream {
            return Err(BridgeError::UnsupportedStyle(options.style.as_str().to_string()));
        }

        let nickname = options
            .nickname
            .clone()
            .unwrap_or_else(|| default_nickname(&self.nickname_prefix));
        self.registry
            .get_or_create(&nickname, || self.create_session(nickname.clone(), options))
            .await
    }

    async fn create_session(&self, nickname: String, options: SessionOptions) -> Result<Arc<Session>> {
        let stored_key = match &options.keyfile {
            Some(path) => keyfile::read_key(path).await?,
            None => None,
        };

        let request = SessionRequest {
            nickname: nickname.clone(),
            style: options.style,
            private_key: stored_key.clone(),
            signature_type: options
                .signature_type
                .clone()
                .or_else(|| self.signature_type.clone()),
            local_port: options.local_port,
            options: options.options.clone(),
            versions: self.versions.clone(),
        };
        let (established, connection) = self.negotiate(SessionCreator::new(request)).await?;

        if let (Some(path), None) = (&options.keyfile, &stored_key) {
            match keyfile::write_new(path, &established.private_key).await {
                Ok(()) => info!(target: LOG_TARGET, "saved session key to {}", path.display()),
                Err(e) => warn!(target: LOG_TARGET, "could not save session key: {}", e),
            }
        }

        let session = Arc::new(Session::new(
            SessionParams {
                nickname,
                version: established.version.clone(),
                style: options.style,
                address: I2pAddress::new(established.public_key, options.local_port),
                private_key: established.private_key,
                auto_close: options.auto_close,
            },
            Arc::downgrade(&self.registry),
        ));

        let (stream, buffer) = connection.into_parts();
        let shutdown = spawn_control(
            stream,
            buffer,
            &established.version,
            &self.keepalive,
            Arc::downgrade(&session),
        );
        session.attach_control(shutdown);

        info!(
            target: LOG_TARGET,
            "session {} ready at {}",
            session.nickname(),
            session.address()
        );
        Ok(session)
    }

    /// Open a stream to `host`, a destination or an `.i2p` name
    pub async fn connect(
        &self,
        session: &Arc<Session>,
        host: &str,
        port: Option<u16>,
        local_port: Option<u16>,
    ) -> Result<I2pStream> {
        if session.is_closed() {
            return Err(BridgeError::SessionClosed);
        }

        let target = ConnectTarget::from_host(host);
        let machine = StreamConnector::new(
            session.nickname(),
            target.clone(),
            port,
            local_port,
            &self.versions,
        );
        let (opened, connection) = self.negotiate(machine).await?;
        let registration = session.add_stream()?;

        let peer = match target {
            ConnectTarget::Name(name) => I2pAddress::with_host(opened.destination, name, port),
            ConnectTarget::Destination(_) => I2pAddress::new(opened.destination, port),
        };
        let local = session
            .address()
            .clone()
            .with_port(local_port.or(session.address().port()));

        debug!(target: LOG_TARGET, "stream to {} open", peer);
        let (stream, buffer) = connection.into_parts();
        Ok(I2pStream::new(
            stream,
            buffer,
            local,
            peer,
            StreamGuard::Session {
                _registration: registration,
            },
        ))
    }

    /// Wait for one inbound stream on `session`
    pub async fn accept(&self, session: &Arc<Session>) -> Result<I2pStream> {
        let connection = self.open_accept(session).await?;
        self.finish_accept(session, connection).await
    }

    /// Register an accept with the router
    async fn open_accept(&self, session: &Arc<Session>) -> Result<Connection> {
        if session.is_closed() {
            return Err(BridgeError::SessionClosed);
        }

        let machine = StreamCommand::new(session.nickname(), StreamMode::Accept, &self.versions);
        let (_, connection) = self.negotiate(machine).await?;
        Ok(connection)
    }

    /// Wait for the peer on an accepting connection
    async fn finish_accept(&self, session: &Arc<Session>, connection: Connection) -> Result<I2pStream> {
        let (mut stream, mut buffer) = connection.into_parts();
        let peer = read_peer_line(&mut stream, &mut buffer).await?;
        let registration = session.add_stream()?;

        let local = session
            .address()
            .clone()
            .with_port(peer.to_port.or(session.address().port()));
        let peer = I2pAddress::new(peer.destination, peer.from_port);

        debug!(target: LOG_TARGET, "accepted stream from {}", peer);
        Ok(I2pStream::new(
            stream,
            buffer,
            local,
            peer,
            StreamGuard::Session {
                _registration: registration,
            },
        ))
    }

    /// Accept inbound streams in the background, passing each to `handler`.
    ///
    /// The loop stops on the first failure to reach the router or a router
    /// error; a peer vanishing before its preamble only skips that stream.
    pub fn listen<F>(&self, session: &Arc<Session>, handler: F) -> Result<StreamListener>
    where
        F: Fn(I2pStream) + Send + Sync + 'static,
    {
        let registration = session.add_stream()?;
        let handler: StreamHandler = Arc::new(handler);
        let client = self.clone();
        let accepting = Arc::clone(session);

        let task = tokio::spawn(async move {
            // keeps the session open while accepting
            let _registration = registration;
            loop {
                let connection = match client.open_accept(&accepting).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        if !accepting.is_closed() {
                            warn!(target: LOG_TARGET, "accept loop stopped: {}", e);
                        }
                        break;
                    }
                };

                match client.finish_accept(&accepting, connection).await {
                    Ok(stream) => handler(stream),
                    Err(e @ (BridgeError::Connection(_) | BridgeError::Protocol(_))) => {
                        debug!(target: LOG_TARGET, "inbound stream dropped: {}", e);
                    }
                    Err(e) => {
                        if !accepting.is_closed() {
                            warn!(target: LOG_TARGET, "accept loop stopped: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        Ok(StreamListener::new(session, task))
    }

    /// Have the router forward inbound streams to a local TCP listener.
    ///
    /// Each forwarded connection is handed to `handler` once its peer
    /// preamble has been read.
    pub async fn forward<F>(&self, session: &Arc<Session>, handler: F) -> Result<StreamListener>
    where
        F: Fn(I2pStream) + Send + Sync + 'static,
    {
        if session.is_closed() {
            return Err(BridgeError::SessionClosed);
        }

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        let machine = StreamCommand::new(
            session.nickname(),
            StreamMode::Forward { port, host: None },
            &self.versions,
        );
        let (_, control) = self.negotiate(machine).await?;
        let registration = session.add_stream()?;
        debug!(target: LOG_TARGET, "forwarding {} to port {}", session.nickname(), port);

        let handler: StreamHandler = Arc::new(handler);
        let local = session.address().clone();
        let task = tokio::spawn(async move {
            // forwarding lasts as long as the control connection is open
            let _control = control;
            let _registration = registration;
            loop {
                let socket = match listener.accept().await {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        warn!(target: LOG_TARGET, "forward listener failed: {}", e);
                        break;
                    }
                };

                let handler = Arc::clone(&handler);
                let local = local.clone();
                tokio::spawn(async move {
                    let mut socket = socket;
                    let mut buffer = BytesMut::new();
                    match read_peer_line(&mut socket, &mut buffer).await {
                        Ok(peer) => {
                            let local = local.with_port(peer.to_port);
                            let peer = I2pAddress::new(peer.destination, peer.from_port);
                            handler(I2pStream::new(
                                Box::new(socket),
                                buffer,
                                local,
                                peer,
                                StreamGuard::None,
                            ));
                        }
                        Err(e) => debug!(target: LOG_TARGET, "forwarded stream dropped: {}", e),
                    }
                });
            }
        });

        Ok(StreamListener::new(session, task))
    }
}

/// Background acceptor of inbound streams on a session.
///
/// The session counts the listener as one of its streams until the
/// background task ends.
pub struct StreamListener {
    local: I2pAddress,
    session: Arc<Session>,
    task: JoinHandle<()>,
}

impl StreamListener {
    fn new(session: &Arc<Session>, task: JoinHandle<()>) -> Self {
        Self {
            local: session.address().clone(),
            session: Arc::clone(session),
            task,
        }
    }

    /// The I2P address streams are accepted on
    pub fn local_addr(&self) -> &I2pAddress {
        &self.local
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether the background task is still accepting
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting. Streams already handed out stay open.
    pub fn close(&mut self) {
        self.task.abort();
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
