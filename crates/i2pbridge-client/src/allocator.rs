//! Nickname and local port allocation
//!
//! Decides whether a BOB negotiation reuses an existing tunnel or creates a
//! new one, and which local ports a new tunnel occupies. Allocation is a
//! pure function of the router's tunnel list and the caller's request so
//! re-running a negotiation always picks the same ports.

use std::collections::HashSet;

use i2pbridge_protocol::TunnelStatus;

/// First port BOB client tunnels listen on
pub const DEFAULT_INPORT: u16 = 9000;

/// First port BOB server tunnels forward to
pub const DEFAULT_OUTPORT: u16 = 9001;

/// Nickname used when the caller does not pick one
pub fn default_nickname(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}

/// Direction of a BOB tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// BOB listens locally and carries connections into I2P
    Client,

    /// BOB accepts I2P connections and forwards them to a local listener
    Server,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Client => "client",
            TunnelKind::Server => "server",
        }
    }
}

/// A pair of adjacent local ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub inport: u16,
    pub outport: u16,
}

impl PortPair {
    /// The port a tunnel of `kind` is configured with
    pub fn for_kind(&self, kind: TunnelKind) -> u16 {
        match kind {
            TunnelKind::Client => self.inport,
            TunnelKind::Server => self.outport,
        }
    }
}

/// First free port pair for a new tunnel.
///
/// Starts at the defaults offset by two per existing tunnel and steps by two
/// until neither port is used by a listed tunnel. `None` once the port space
/// is exhausted.
pub fn allocate_ports(tunnels: &[TunnelStatus]) -> Option<PortPair> {
    let occupied: HashSet<u16> = tunnels.iter().flat_map(TunnelStatus::ports).collect();
    let offset = 2 * tunnels.len() as u32;

    let mut inport = u32::from(DEFAULT_INPORT) + offset;
    loop {
        let outport = inport + 1;
        let pair = PortPair {
            inport: u16::try_from(inport).ok()?,
            outport: u16::try_from(outport).ok()?,
        };
        if !occupied.contains(&pair.inport) && !occupied.contains(&pair.outport) {
            return Some(pair);
        }
        inport += 2;
    }
}

/// Caller inputs relevant to allocation
#[derive(Debug, Clone, Default)]
pub struct TunnelRequest {
    pub nickname: Option<String>,
    pub port: Option<u16>,
}

/// Reuse or create decision for one negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPlan {
    pub nickname: String,

    /// Port for the tunnel's local side
    pub port: u16,

    /// Set when a tunnel with the nickname already exists
    pub existing: Option<ExistingTunnel>,
}

/// Snapshot of a listed tunnel being reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingTunnel {
    pub running: bool,
}

impl TunnelPlan {
    /// Whether this negotiation creates (and therefore owns) the tunnel
    pub fn creates_tunnel(&self) -> bool {
        self.existing.is_none()
    }
}

/// Decide how to satisfy `request` given the router's current tunnels.
///
/// A tunnel with the requested nickname, or the default nickname when none
/// was requested, is reused keeping its configured port; otherwise a new
/// tunnel and port pair are chosen. A port supplied by the caller always wins.
pub fn plan_tunnel(
    kind: TunnelKind,
    tunnels: &[TunnelStatus],
    request: &TunnelRequest,
    prefix: &str,
) -> Option<TunnelPlan> {
    let nickname = request
        .nickname
        .clone()
        .unwrap_or_else(|| default_nickname(prefix));

    if let Some(tunnel) = tunnels.iter().find(|tunnel| tunnel.nickname == nickname) {
        let configured = match kind {
            TunnelKind::Client => tunnel.inport,
            TunnelKind::Server => tunnel.outport,
        };
        let port = match request.port.or(configured) {
            Some(port) => port,
            None => allocate_ports(tunnels)?.for_kind(kind),
        };

        return Some(TunnelPlan {
            nickname,
            port,
            existing: Some(ExistingTunnel {
                running: tunnel.running,
            }),
        });
    }

    let port = match request.port {
        Some(port) => port,
        None => allocate_ports(tunnels)?.for_kind(kind),
    };

    Some(TunnelPlan {
        nickname,
        port,
        existing: None,
    })
}
