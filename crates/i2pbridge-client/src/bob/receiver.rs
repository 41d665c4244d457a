//! BOB negotiation state machines
//!
//! Each machine tracks the command it last sent in an explicit state and
//! reacts to exactly one router reply per [`Negotiation::handle`] call.

use bytes::Bytes;
use i2pbridge_protocol::bob::{self, BobReply, BobRule};
use i2pbridge_protocol::{Parsed, TunnelStatus};
use log::{debug, info, warn};

use crate::allocator::{plan_tunnel, TunnelKind, TunnelPlan, TunnelRequest};
use crate::bob::sender::BobSender;
use crate::driver::{Negotiation, Progress};
use crate::error::{BridgeError, Result};

const LOG_TARGET: &str = "i2pbridge::bob";

/// Replies meaning the tunnel is busy and the command should be resent
const TRANSIENT_ERRORS: [&str; 2] = ["tunnel is active", "tunnel shutting down"];

fn is_transient(info: &str) -> bool {
    TRANSIENT_ERRORS.contains(&info)
}

fn expect_ok(reply: &BobReply, command: &str) -> Result<()> {
    if reply.success() {
        Ok(())
    } else {
        warn!(target: LOG_TARGET, "{} failed: {}", command, reply.info());
        Err(BridgeError::bob(reply.info()))
    }
}

fn tunnel_list(reply: &BobReply) -> Result<Vec<TunnelStatus>> {
    expect_ok(reply, "list")?;
    reply
        .data()
        .iter()
        .map(|item| TunnelStatus::parse(item).map_err(BridgeError::from))
        .collect()
}

/// Counts resends of a busy-tunnel command
#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    limit: Option<u32>,
    used: u32,
}

impl RetryBudget {
    fn new(limit: Option<u32>) -> Self {
        Self { limit, used: 0 }
    }

    fn spend(&mut self) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.used >= limit {
                return Err(BridgeError::RetryLimit(limit));
            }
        }
        self.used += 1;
        Ok(())
    }
}

/// Caller inputs for creating or reusing a tunnel
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub kind: TunnelKind,
    pub nickname: Option<String>,

    /// Keypair to install on a new tunnel; fresh keys are generated otherwise
    pub keypair: Option<String>,

    /// Local host BOB listens on (client) or forwards to (server)
    pub host: String,

    /// Local port; allocated when unset
    pub port: Option<u16>,

    pub nickname_prefix: String,
    pub retry_limit: Option<u32>,
}

/// A started tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub kind: TunnelKind,
    pub nickname: String,

    /// Public destination of the tunnel
    pub destination: String,

    /// Full keypair, when the router disclosed it
    pub keypair: Option<String>,

    pub host: String,
    pub port: u16,

    /// Whether this negotiation created the tunnel (as opposed to reusing one)
    pub created: bool,

    /// Whether the router generated the keypair during this negotiation
    pub keys_generated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateState {
    Init,
    List,
    Getnick,
    Stop,
    Setnick,
    Setkeys,
    Newkeys,
    Getdest,
    Getkeys,
    Host,
    Port,
    Start,
    Quit,
    Done,
}

/// Creates a client or server tunnel, reusing one with the same nickname
pub struct TunnelCreator {
    spec: TunnelSpec,
    sender: BobSender,
    state: CreateState,
    plan: Option<TunnelPlan>,
    destination: Option<String>,
    keypair: Option<String>,
    keys_generated: bool,
    retries: RetryBudget,
    outcome: Option<TunnelInfo>,
}

impl TunnelCreator {
    pub fn new(spec: TunnelSpec) -> Self {
        let retries = RetryBudget::new(spec.retry_limit);
        let keypair = spec.keypair.clone();
        Self {
            spec,
            sender: BobSender::new(),
            state: CreateState::Init,
            plan: None,
            destination: None,
            keypair,
            keys_generated: false,
            retries,
            outcome: None,
        }
    }

    fn reusing(&self) -> bool {
        self.plan.as_ref().is_some_and(|plan| !plan.creates_tunnel())
    }

    fn plan(&self) -> Result<&TunnelPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("tunnel plan missing".to_string()))
    }

    fn send_host(&mut self) {
        match self.spec.kind {
            TunnelKind::Client => self.sender.inhost(&self.spec.host),
            TunnelKind::Server => self.sender.outhost(&self.spec.host),
        }
        self.state = CreateState::Host;
    }

    fn send_port(&mut self) -> Result<()> {
        let port = self.plan()?.port;
        match self.spec.kind {
            TunnelKind::Client => self.sender.inport(port),
            TunnelKind::Server => self.sender.outport(port),
        }
        self.state = CreateState::Port;
        Ok(())
    }

    fn on_list(&mut self, reply: &BobReply) -> Result<()> {
        let tunnels = tunnel_list(reply)?;
        let request = TunnelRequest {
            nickname: self.spec.nickname.clone(),
            port: self.spec.port,
        };
        let plan = plan_tunnel(self.spec.kind, &tunnels, &request, &self.spec.nickname_prefix)
            .ok_or(BridgeError::NoFreePorts)?;

        if plan.creates_tunnel() {
            debug!(
                target: LOG_TARGET,
                "creating {} tunnel {} on port {}",
                self.spec.kind.as_str(),
                plan.nickname,
                plan.port
            );
            self.sender.setnick(&plan.nickname);
            self.state = CreateState::Setnick;
        } else {
            debug!(target: LOG_TARGET, "reusing tunnel {}", plan.nickname);
            self.sender.getnick(&plan.nickname);
            self.state = CreateState::Getnick;
        }
        self.plan = Some(plan);
        Ok(())
    }

    fn on_started(&mut self) -> Result<()> {
        let (nickname, port, created) = {
            let plan = self.plan()?;
            (plan.nickname.clone(), plan.port, plan.creates_tunnel())
        };
        let destination = self.destination.clone().ok_or_else(|| {
            BridgeError::Protocol("router never reported a destination".to_string())
        })?;

        info!(target: LOG_TARGET, "{} tunnel {} started", self.spec.kind.as_str(), nickname);
        self.outcome = Some(TunnelInfo {
            kind: self.spec.kind,
            nickname,
            destination,
            keypair: self.keypair.clone(),
            host: self.spec.host.clone(),
            port,
            created,
            keys_generated: self.keys_generated,
        });

        self.sender.quit();
        self.state = CreateState::Quit;
        Ok(())
    }
}

impl Negotiation for TunnelCreator {
    type Reply = BobReply;
    type Output = TunnelInfo;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<BobReply>> {
        let rule = match self.state {
            CreateState::Init => BobRule::Init,
            CreateState::List => BobRule::List,
            _ => BobRule::Reply,
        };
        bob::parse(rule, input)
    }

    fn handle(&mut self, reply: BobReply) -> Result<Progress<TunnelInfo>> {
        match self.state {
            CreateState::Init => {
                self.sender.list();
                self.state = CreateState::List;
            }
            CreateState::List => self.on_list(&reply)?,
            CreateState::Getnick => {
                expect_ok(&reply, "getnick")?;
                let running = self
                    .plan()?
                    .existing
                    .as_ref()
                    .is_some_and(|existing| existing.running);
                if running {
                    self.sender.stop();
                    self.state = CreateState::Stop;
                } else {
                    self.sender.getdest();
                    self.state = CreateState::Getdest;
                }
            }
            CreateState::Stop => {
                expect_ok(&reply, "stop")?;
                self.sender.getdest();
                self.state = CreateState::Getdest;
            }
            CreateState::Setnick => {
                expect_ok(&reply, "setnick")?;
                match self.spec.keypair.clone() {
                    Some(keypair) => {
                        self.sender.setkeys(&keypair);
                        self.state = CreateState::Setkeys;
                    }
                    None => {
                        self.sender.newkeys();
                        self.state = CreateState::Newkeys;
                    }
                }
            }
            CreateState::Setkeys => {
                expect_ok(&reply, "setkeys")?;
                if !reply.info().is_empty() {
                    self.destination = Some(reply.info().to_string());
                }
                self.sender.getdest();
                self.state = CreateState::Getdest;
            }
            CreateState::Newkeys => {
                expect_ok(&reply, "newkeys")?;
                self.destination = Some(reply.info().to_string());
                self.keys_generated = true;
                self.sender.getkeys();
                self.state = CreateState::Getkeys;
            }
            CreateState::Getdest => {
                expect_ok(&reply, "getdest")?;
                self.destination = Some(reply.info().to_string());
                if self.reusing() {
                    self.sender.getkeys();
                    self.state = CreateState::Getkeys;
                } else {
                    self.send_host();
                }
            }
            CreateState::Getkeys => {
                expect_ok(&reply, "getkeys")?;
                self.keypair = Some(reply.info().to_string());
                self.send_host();
            }
            CreateState::Host => {
                if reply.success() {
                    self.send_port()?;
                } else if is_transient(reply.info()) {
                    debug!(target: LOG_TARGET, "tunnel busy ({}), resending host", reply.info());
                    self.retries.spend()?;
                    self.send_host();
                } else {
                    warn!(target: LOG_TARGET, "host failed: {}", reply.info());
                    return Err(BridgeError::bob(reply.info()));
                }
            }
            CreateState::Port => {
                expect_ok(&reply, "port")?;
                self.sender.start();
                self.state = CreateState::Start;
            }
            CreateState::Start => {
                expect_ok(&reply, "start")?;
                self.on_started()?;
            }
            CreateState::Quit => {
                self.state = CreateState::Done;
                return self
                    .outcome
                    .take()
                    .map(Progress::Done)
                    .ok_or_else(|| BridgeError::Protocol("tunnel outcome missing".to_string()));
            }
            CreateState::Done => {
                return Err(BridgeError::Protocol(format!(
                    "unexpected reply after quit: {}",
                    reply.info()
                )))
            }
        }

        Ok(Progress::Continue)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }

    fn on_eof(&mut self) -> Option<TunnelInfo> {
        match self.state {
            CreateState::Quit => self.outcome.take(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveState {
    Init,
    List,
    Getnick,
    Stop,
    Clear,
    Quit,
    Done,
}

/// Stops and clears a tunnel by nickname.
///
/// Yields `true` if the tunnel was removed, `false` if it did not exist.
pub struct TunnelRemover {
    nickname: String,
    sender: BobSender,
    state: RemoveState,
    retries: RetryBudget,
    removed: bool,
}

impl TunnelRemover {
    pub fn new(nickname: impl Into<String>, retry_limit: Option<u32>) -> Self {
        Self {
            nickname: nickname.into(),
            sender: BobSender::new(),
            state: RemoveState::Init,
            retries: RetryBudget::new(retry_limit),
            removed: false,
        }
    }
}

impl Negotiation for TunnelRemover {
    type Reply = BobReply;
    type Output = bool;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<BobReply>> {
        let rule = match self.state {
            RemoveState::Init => BobRule::Init,
            RemoveState::List => BobRule::List,
            _ => BobRule::Reply,
        };
        bob::parse(rule, input)
    }

    fn handle(&mut self, reply: BobReply) -> Result<Progress<bool>> {
        match self.state {
            RemoveState::Init => {
                self.sender.list();
                self.state = RemoveState::List;
            }
            RemoveState::List => {
                let tunnels = tunnel_list(&reply)?;
                if tunnels.iter().any(|tunnel| tunnel.nickname == self.nickname) {
                    self.sender.getnick(&self.nickname);
                    self.state = RemoveState::Getnick;
                } else {
                    debug!(target: LOG_TARGET, "tunnel {} already gone", self.nickname);
                    self.sender.quit();
                    self.state = RemoveState::Done;
                    return Ok(Progress::Done(false));
                }
            }
            RemoveState::Getnick => {
                expect_ok(&reply, "getnick")?;
                self.sender.stop();
                self.state = RemoveState::Stop;
            }
            RemoveState::Stop => {
                expect_ok(&reply, "stop")?;
                self.sender.clear();
                self.state = RemoveState::Clear;
            }
            RemoveState::Clear => {
                if reply.success() {
                    info!(target: LOG_TARGET, "tunnel {} removed", self.nickname);
                    self.removed = true;
                    self.sender.quit();
                    self.state = RemoveState::Quit;
                } else if is_transient(reply.info()) {
                    debug!(target: LOG_TARGET, "tunnel busy ({}), resending clear", reply.info());
                    self.retries.spend()?;
                    self.sender.clear();
                } else {
                    warn!(target: LOG_TARGET, "clear failed: {}", reply.info());
                    return Err(BridgeError::bob(reply.info()));
                }
            }
            RemoveState::Quit => {
                self.state = RemoveState::Done;
                return Ok(Progress::Done(self.removed));
            }
            RemoveState::Done => {
                return Err(BridgeError::Protocol(format!(
                    "unexpected reply after quit: {}",
                    reply.info()
                )))
            }
        }

        Ok(Progress::Continue)
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }

    fn on_eof(&mut self) -> Option<bool> {
        match self.state {
            RemoveState::Quit => Some(self.removed),
            _ => None,
        }
    }
}

/// Reads the banner and leaves; used to check BOB is reachable
#[derive(Default)]
pub struct BobProbe {
    sender: BobSender,
    version: Option<String>,
}

impl BobProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Negotiation for BobProbe {
    type Reply = BobReply;
    type Output = String;

    fn parse(&self, input: &[u8]) -> i2pbridge_protocol::Result<Parsed<BobReply>> {
        match self.version {
            None => bob::parse(BobRule::Init, input),
            Some(_) => bob::parse(BobRule::Reply, input),
        }
    }

    fn handle(&mut self, reply: BobReply) -> Result<Progress<String>> {
        if let Some(version) = &self.version {
            return Ok(Progress::Done(version.clone()));
        }

        match reply {
            BobReply::Init { version } => {
                self.version = Some(version);
                self.sender.quit();
                Ok(Progress::Continue)
            }
            other => Err(BridgeError::Protocol(format!(
                "expected BOB banner, got {:?}",
                other
            ))),
        }
    }

    fn outgoing(&mut self) -> Bytes {
        self.sender.take()
    }

    fn on_eof(&mut self) -> Option<String> {
        self.version.take()
    }
}
