//! SAM negotiation state machines
//!
//! Every negotiation opens with `HELLO VERSION` and records the version the
//! router agreed to; optional features are gated on it afterwards.

use bytes::Bytes;
use i2pbridge_protocol::{Parsed, SamReply, SamVersion};
use log::{debug, warn};

use crate::driver::{Negotiation, Progress};
use crate::error::{BridgeError, Result};
use crate::sam::sender::{SamSender, SessionCreate, SessionStyle};

const LOG_TARGET: &str = "i2pbridge::sam";

/// Signature type requested when the caller does not pick one
pub const DEFAULT_SIGNATURE_TYPE: &str = "EdDSA_SHA512_Ed25519";

/// Version range offered in `HELLO VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: SamVersion,
    pub max: SamVersion,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: SamVersion::new(3, 0),
            max: SamVersion::new(3, 3),
        }
    }
}

fn unexpected(expected: &str, reply: &SamReply) -> BridgeError {
    BridgeError::Protocol(format!("expected {}, got {:?}", expected, reply))
}

/// Validate `HELLO REPLY` and extract the negotiated version
fn hello_version(reply: &SamReply) -> Result<SamVersion> {
    match reply {
        SamReply::Hello {
            result,
            version,
            message,
        } => {
            if !result.is_ok() {
                return Err(BridgeError::sam(result, message.as_deref()));
            }
            version
                .clone()
                .ok_or_else(|| BridgeError::Protocol("HELLO REPLY without VERSION".to_string()))
        }
        other => Err(unexpected("HELLO REPLY", other)),
    }
}

/// Answer a router `PING`; returns whether `reply` was a keepalive line
fn answer_keepalive(sender: &mut SamSender, reply: &SamReply) -> bool {
    match reply {
        SamReply::Ping(token) => {
            sender.pong(token.as_deref());
            true
        }
        SamReply::Pong(_) => true,
        _ => false,
    }
}

/// Resolve a `NAMING REPLY` to the destination it carries
fn naming_value(reply: &SamReply) -> Result<String> {
    match reply {
        SamReply::NamingReply {
            result,
            value,
            message,
            ..
        } => {
            if !result.is_ok() {
                return Err(BridgeError::sam(result, message.as_deref()));
            }
            value
                .clone()
                .ok_or_else(|| BridgeError::Protocol("NAMING REPLY without VALUE".to_string()))
        }
        other => Err(unexpected("NAMING REPLY", other)),
    }
}

/// Signature type selection with a single fallback
#[derive(Debug, Clone)]
struct SignatureChoice {
    requested: Option<String>,
    fallback: Option<&'static str>,
}

impl SignatureChoice {
    fn new(requested: Option<String>) -> Self {
        Self {
            requested,
            fallback: None,
        }
    }

    fn current(&self) -> &str {
        self.fallback
            .or(self.requested.as_deref())
            .unwrap_or(DEFAULT_SIGNATURE_TYPE)
    }

    /// Switch to a fallback if the router rejected the signature type we
    /// picked on the caller's behalf. Only ever falls back once.
    fn fall_back(&mut self, version: &SamVersion, message: Option<&str>) -> bool {
        let Some(message) = message else {
            return false;
        };
        if self.requested.is_some()
            || self.fallback.is_some()
            || !version.at_least(3, 1)
            || !message.starts_with("SIGNATURE_TYPE")
        {
            return false;
        }

        let fallback = if message.contains("ECDSA_SHA256_P256") {
            "DSA_SHA1"
        } else {
            "ECDSA_SHA256_P256"
        };
        warn!(target: LOG_TARGET, "{}, falling back to {}", message, fallback);
        self.fallback = Some(fallback);
        true
    }
}

/// Caller inputs for `SESSION CREATE`
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub nickname: String,
    pub style: SessionStyle,

    /// Private key to register; the router generates one when absent
    pub private_key: Option<String>,
    pub signature_type: Option<String>,
    pub local_port: Option<u16>,

    /// Extra I2CP options appended to `SESSION CREATE`
    pub options: Vec<(String, String)>,
    pub versions: VersionRange,
}

/// A session the router accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablished {
    pub version: SamVersion,
    pub id: String,
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Hello,
    Create,
    Naming,
    Done,
}

/// Registers a session and looks up its public destination
pub struct SessionCreator {
    request: SessionRequest,
    sender: SamSender,
    state: SessionState,
    version: Option<SamVersion>,
    signature: SignatureChoice,
    private_key: Option<String>,
}

impl SessionCreator {
    pub fn new(request: SessionRequest) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&request.versions.min, &request.versions.max);
        let signature = SignatureChoice::new(request.signature_type.clone());

        Self {
            request,
            sender,
            state: SessionState::Hello,
            version: None,
            signature,
            private_key: None,
        }
    }

    fn version(&self) -> Result<&SamVersion> {
        self.version
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("SAM version not negotiated".to_string()))
    }

    fn send_create(&mut self) -> Result<()> {
        let version = self.version()?.clone();
        let signature_type = (self.request.private_key.is_none() && version.at_least(3, 1))
            .then(|| self.signature.current().to_string());
        let from_port = self.request.local_port.filter(|_| version.at_least(3, 2));

        self.sender.session_create(SessionCreate {
            style: self.request.style,
            id: &self.request.nickname,
            private_key: self.request.private_key.as_deref(),
            signature_type: signature_type.as_deref(),
            from_port,
            options: &self.request.options,
        });
        self.state = SessionState::Create;
        Ok(())
    }
}

impl Negotiation for SessionCreator {
    type Reply = SamReply;
    type Output = SessionEstablished;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<SessionEstablished>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        match self.state {
            SessionState::Hello => {
                self.version = Some(hello_version(&reply)?);
                self.send_create()?;
            }
            SessionState::Create => {
                let SamReply::SessionStatus {
                    result,
                    destination,
                    message,
                } = reply
                else {
                    return Err(unexpected("SESSION STATUS", &reply));
                };

                if !result.is_ok() {
                    let version = self.version()?.clone();
                    if self.request.private_key.is_none()
                        && self.signature.fall_back(&version, message.as_deref())
                    {
                        self.send_create()?;
                        return Ok(Progress::Continue);
                    }
                    return Err(BridgeError::sam(&result, message.as_deref()));
                }

                self.private_key = destination.or_else(|| self.request.private_key.clone());
                self.sender.naming_lookup("ME");
                self.state = SessionState::Naming;
            }
            SessionState::Naming => {
                let public_key = naming_value(&reply)?;
                let private_key = self.private_key.take().ok_or_else(|| {
                    BridgeError::Protocol("SESSION STATUS without DESTINATION".to_string())
                })?;

                debug!(target: LOG_TARGET, "session {} established", self.request.nickname);
                self.state = SessionState::Done;
                return Ok(Progress::Done(SessionEstablished {
                    version: self.version()?.clone(),
                    id: self.request.nickname.clone(),
                    private_key,
                    public_key,
                }));
            }
            SessionState::Done => return Err(unexpected("nothing", &reply)),
        }

        Ok(Progress::Continue)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}

/// Freshly generated destination keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationKeys {
    pub public: String,
    pub private: String,
}

/// Asks the router for a new destination
pub struct DestGenerator {
    sender: SamSender,
    version: Option<SamVersion>,
    signature: SignatureChoice,
}

impl DestGenerator {
    pub fn new(signature_type: Option<String>, versions: &VersionRange) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&versions.min, &versions.max);

        Self {
            sender,
            version: None,
            signature: SignatureChoice::new(signature_type),
        }
    }

    fn send_generate(&mut self, version: &SamVersion) {
        let signature_type = version.at_least(3, 1).then(|| self.signature.current());
        self.sender.dest_generate(signature_type);
    }
}

impl Negotiation for DestGenerator {
    type Reply = SamReply;
    type Output = DestinationKeys;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<DestinationKeys>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        let Some(version) = self.version.clone() else {
            let version = hello_version(&reply)?;
            self.send_generate(&version);
            self.version = Some(version);
            return Ok(Progress::Continue);
        };

        match reply {
            SamReply::DestReply {
                result,
                public,
                private,
                message,
            } => {
                if !result.is_ok() {
                    if self.signature.fall_back(&version, message.as_deref()) {
                        self.send_generate(&version);
                        return Ok(Progress::Continue);
                    }
                    return Err(BridgeError::sam(&result, message.as_deref()));
                }

                match (public, private) {
                    (Some(public), Some(private)) => {
                        Ok(Progress::Done(DestinationKeys { public, private }))
                    }
                    _ => Err(BridgeError::Protocol(
                        "DEST REPLY without PUB and PRIV".to_string(),
                    )),
                }
            }
            other => Err(unexpected("DEST REPLY", &other)),
        }
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}

/// Where a stream should connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A literal destination
    Destination(String),

    /// A hostname resolved through `NAMING LOOKUP` first
    Name(String),
}

impl ConnectTarget {
    /// Classify a caller-supplied host: `.i2p` names need a lookup
    pub fn from_host(host: &str) -> Self {
        if host.ends_with(".i2p") {
            ConnectTarget::Name(host.to_string())
        } else {
            ConnectTarget::Destination(host.to_string())
        }
    }
}

/// A connected stream's negotiated details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpened {
    pub version: SamVersion,

    /// Destination actually connected to
    pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Hello,
    Lookup,
    Connect,
    Done,
}

/// Opens an outbound stream over an existing session
pub struct StreamConnector {
    session_id: String,
    target: ConnectTarget,
    to_port: Option<u16>,
    from_port: Option<u16>,
    sender: SamSender,
    state: ConnectState,
    version: Option<SamVersion>,
    destination: Option<String>,
}

impl StreamConnector {
    pub fn new(
        session_id: impl Into<String>,
        target: ConnectTarget,
        to_port: Option<u16>,
        from_port: Option<u16>,
        versions: &VersionRange,
    ) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&versions.min, &versions.max);

        Self {
            session_id: session_id.into(),
            target,
            to_port,
            from_port,
            sender,
            state: ConnectState::Hello,
            version: None,
            destination: None,
        }
    }

    fn send_connect(&mut self, destination: String) -> Result<()> {
        let ports = self
            .version
            .as_ref()
            .is_some_and(|version| version.at_least(3, 2));
        let (to_port, from_port) = if ports {
            (self.to_port, self.from_port)
        } else {
            (None, None)
        };

        self.sender
            .stream_connect(&self.session_id, &destination, to_port, from_port);
        self.destination = Some(destination);
        self.state = ConnectState::Connect;
        Ok(())
    }
}

impl Negotiation for StreamConnector {
    type Reply = SamReply;
    type Output = StreamOpened;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<StreamOpened>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        match self.state {
            ConnectState::Hello => {
                self.version = Some(hello_version(&reply)?);
                match self.target.clone() {
                    ConnectTarget::Destination(destination) => self.send_connect(destination)?,
                    ConnectTarget::Name(name) => {
                        self.sender.naming_lookup(&name);
                        self.state = ConnectState::Lookup;
                    }
                }
            }
            ConnectState::Lookup => {
                let destination = naming_value(&reply)?;
                self.send_connect(destination)?;
            }
            ConnectState::Connect => match reply {
                SamReply::StreamStatus { result, message } => {
                    if !result.is_ok() {
                        return Err(BridgeError::sam(&result, message.as_deref()));
                    }
                    self.state = ConnectState::Done;
                    let (Some(version), Some(destination)) =
                        (self.version.clone(), self.destination.clone())
                    else {
                        return Err(BridgeError::Protocol("stream state incomplete".to_string()));
                    };
                    return Ok(Progress::Done(StreamOpened {
                        version,
                        destination,
                    }));
                }
                other => return Err(unexpected("STREAM STATUS", &other)),
            },
            ConnectState::Done => return Err(unexpected("nothing", &reply)),
        }

        Ok(Progress::Continue)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}

/// Which stream-level command a [`StreamCommand`] issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMode {
    /// `STREAM ACCEPT`: the connection will carry one inbound stream
    Accept,

    /// `STREAM FORWARD`: inbound streams are forwarded to a local port
    Forward { port: u16, host: Option<String> },
}

/// `STREAM ACCEPT` / `STREAM FORWARD` negotiation.
///
/// Yields the negotiated version once the router confirms; for accepts the
/// peer preamble follows on the same connection.
pub struct StreamCommand {
    session_id: String,
    mode: StreamMode,
    sender: SamSender,
    version: Option<SamVersion>,
}

impl StreamCommand {
    pub fn new(session_id: impl Into<String>, mode: StreamMode, versions: &VersionRange) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&versions.min, &versions.max);

        Self {
            session_id: session_id.into(),
            mode,
            sender,
            version: None,
        }
    }
}

impl Negotiation for StreamCommand {
    type Reply = SamReply;
    type Output = SamVersion;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<SamVersion>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        let Some(version) = self.version.clone() else {
            self.version = Some(hello_version(&reply)?);
            match &self.mode {
                StreamMode::Accept => self.sender.stream_accept(&self.session_id),
                StreamMode::Forward { port, host } => {
                    self.sender
                        .stream_forward(&self.session_id, *port, host.as_deref())
                }
            }
            return Ok(Progress::Continue);
        };

        match reply {
            SamReply::StreamStatus { result, message } => {
                if !result.is_ok() {
                    return Err(BridgeError::sam(&result, message.as_deref()));
                }
                Ok(Progress::Done(version))
            }
            other => Err(unexpected("STREAM STATUS", &other)),
        }
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}

/// Resolves a name through `NAMING LOOKUP`
pub struct NameLookup {
    name: String,
    sender: SamSender,
    version: Option<SamVersion>,
}

impl NameLookup {
    pub fn new(name: impl Into<String>, versions: &VersionRange) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&versions.min, &versions.max);

        Self {
            name: name.into(),
            sender,
            version: None,
        }
    }
}

impl Negotiation for NameLookup {
    type Reply = SamReply;
    type Output = String;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<String>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        if self.version.is_none() {
            self.version = Some(hello_version(&reply)?);
            self.sender.naming_lookup(&self.name);
            return Ok(Progress::Continue);
        }

        naming_value(&reply).map(Progress::Done)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}

/// Performs the hello exchange only, to check the API is reachable
pub struct ApiProbe {
    sender: SamSender,
}

impl ApiProbe {
    pub fn new(versions: &VersionRange) -> Self {
        let mut sender = SamSender::new();
        sender.hello(&versions.min, &versions.max);
        Self { sender }
    }
}

impl Negotiation for ApiProbe {
    type Reply = SamReply;
    type Output = SamVersion;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<SamReply>> {
        SamReply::parse(input)
    }

    fn handle(&mut self, reply: SamReply) -> Result<Progress<SamVersion>> {
        if answer_keepalive(&mut self.sender, &reply) {
            return Ok(Progress::Continue);
        }

        hello_version(&reply).map(Progress::Done)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }
}
