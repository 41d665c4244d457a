//! BOB client
//!
//! BOB exposes tunnels as local TCP ports. A client tunnel listens on
//! `inhost:inport` and expects the target destination as the first line of
//! every connection; a server tunnel connects to `outhost:outport` and sends
//! the peer's destination as the first line.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use i2pbridge_protocol::I2pAddress;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use crate::allocator::TunnelKind;
use crate::bob::receiver::{BobProbe, TunnelCreator, TunnelInfo, TunnelRemover, TunnelSpec};
use crate::config::BridgeConfig;
use crate::driver::{Connection, Negotiation};
use crate::error::{BridgeError, Result};
use crate::keyfile;
use crate::session::lock;
use crate::transport::{Connector, TcpConnector};
use crate::wrapper::{read_peer_line, I2pStream, StreamGuard};

const LOG_TARGET: &str = "i2pbridge::bob";

/// Per-tunnel settings; unset fields fall back to configuration
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    /// Existing tunnels with this nickname are reused
    pub nickname: Option<String>,

    /// Local host BOB listens on or forwards to
    pub host: Option<String>,

    /// Local port; allocated from 9000 upwards when unset
    pub port: Option<u16>,
}

/// Client for the BOB bridge
#[derive(Clone)]
pub struct BobClient {
    connector: Arc<dyn Connector>,
    retry_limit: Option<u32>,
    inhost: String,
    outhost: String,
    nickname_prefix: String,
    connect_timeout: Duration,
    negotiation_timeout: Duration,

    /// Live guards per tunnel this process created
    owned: Arc<Mutex<HashMap<String, usize>>>,
}

impl fmt::Debug for BobClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BobClient")
            .field("inhost", &self.inhost)
            .field("outhost", &self.outhost)
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

impl BobClient {
    pub fn new(connector: Arc<dyn Connector>, config: &BridgeConfig) -> Self {
        Self {
            connector,
            retry_limit: config.bob.retry_limit,
            inhost: config.bob.inhost.clone(),
            outhost: config.bob.outhost.clone(),
            nickname_prefix: config.nickname_prefix.clone(),
            connect_timeout: config.timeouts.connect(),
            negotiation_timeout: config.timeouts.negotiation(),
            owned: Arc::default(),
        }
    }

    /// Client talking to the configured BOB address over TCP
    pub fn tcp(config: &BridgeConfig) -> Self {
        let connector = TcpConnector::new(config.bob.address.clone(), config.timeouts.connect());
        Self::new(Arc::new(connector), config)
    }

    async fn negotiate<N: Negotiation>(&self, mut machine: N) -> Result<N::Output> {
        let stream = self.connector.connect().await?;
        Connection::new(stream)
            .drive_for(&mut machine, self.negotiation_timeout)
            .await
    }

    /// Check BOB is reachable; returns its banner version
    pub async fn probe(&self) -> Result<String> {
        self.negotiate(BobProbe::new()).await
    }

    /// Stop and clear the tunnel `nickname`.
    ///
    /// Returns `false` if no such tunnel existed.
    pub async fn remove_tunnel(&self, nickname: &str) -> Result<bool> {
        self.negotiate(TunnelRemover::new(nickname, self.retry_limit))
            .await
    }

    async fn create_tunnel(
        &self,
        kind: TunnelKind,
        options: TunnelOptions,
        keypair: Option<String>,
    ) -> Result<TunnelInfo> {
        let host = options.host.unwrap_or_else(|| match kind {
            TunnelKind::Client => self.inhost.clone(),
            TunnelKind::Server => self.outhost.clone(),
        });

        self.negotiate(TunnelCreator::new(TunnelSpec {
            kind,
            nickname: options.nickname,
            keypair,
            host,
            port: options.port,
            nickname_prefix: self.nickname_prefix.clone(),
            retry_limit: self.retry_limit,
        }))
        .await
    }

    /// Guard for `tunnel` if this process owns it.
    ///
    /// A reused tunnel is still ours when an earlier call created it; the
    /// tunnel is removed once its last guard drops.
    fn guard(&self, tunnel: &TunnelInfo) -> Option<TunnelGuard> {
        let mut owned = lock(&self.owned);
        if tunnel.created {
            *owned.entry(tunnel.nickname.clone()).or_insert(0) += 1;
        } else {
            *owned.get_mut(&tunnel.nickname)? += 1;
        }

        Some(TunnelGuard {
            client: self.clone(),
            nickname: tunnel.nickname.clone(),
        })
    }

    /// Drop one user of `nickname`; true if it was the last
    fn release(&self, nickname: &str) -> bool {
        let mut owned = lock(&self.owned);
        match owned.get_mut(nickname) {
            Some(users) if *users > 1 => {
                *users -= 1;
                false
            }
            Some(_) => {
                owned.remove(nickname);
                true
            }
            None => false,
        }
    }

    /// Number of live guards for `nickname`
    pub fn tunnel_users(&self, nickname: &str) -> usize {
        lock(&self.owned).get(nickname).copied().unwrap_or(0)
    }

    /// Connect to `destination` (a destination or an `.i2p` name) through a
    /// client tunnel
    pub async fn connect(&self, destination: &str, options: TunnelOptions) -> Result<I2pStream> {
        let tunnel = self.create_tunnel(TunnelKind::Client, options, None).await?;
        // removes the tunnel again if anything below fails
        let guard = self.guard(&tunnel);

        let address = (tunnel.host.as_str(), tunnel.port);
        let mut socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| BridgeError::Timeout)??;
        socket.write_all(format!("{}\n", destination).as_bytes()).await?;

        let peer = if destination.ends_with(".i2p") {
            I2pAddress::with_host(destination, destination, None)
        } else {
            I2pAddress::new(destination, None)
        };
        debug!(target: LOG_TARGET, "connected to {} via tunnel {}", peer, tunnel.nickname);

        Ok(I2pStream::new(
            Box::new(socket),
            BytesMut::new(),
            I2pAddress::new(tunnel.destination, None),
            peer,
            guard
                .map(|tunnel| StreamGuard::Tunnel { _tunnel: tunnel })
                .unwrap_or_default(),
        ))
    }

    /// Serve on the destination stored in `keyfile` through a server tunnel.
    ///
    /// A missing keyfile is filled with freshly generated keys once the
    /// tunnel is up.
    pub async fn listen(&self, keyfile: &Path, options: TunnelOptions) -> Result<BobListener> {
        let stored = keyfile::read_key(keyfile).await?;
        let tunnel = self
            .create_tunnel(TunnelKind::Server, options, stored.clone())
            .await?;
        let guard = self.guard(&tunnel);

        if stored.is_none() {
            match &tunnel.keypair {
                Some(keypair) => match keyfile::write_new(keyfile, keypair).await {
                    Ok(()) => info!(target: LOG_TARGET, "saved tunnel keys to {}", keyfile.display()),
                    Err(e) => warn!(target: LOG_TARGET, "could not save tunnel keys: {}", e),
                },
                None => warn!(target: LOG_TARGET, "router did not disclose the tunnel keys"),
            }
        }

        let listener = TcpListener::bind((tunnel.host.as_str(), tunnel.port)).await?;
        info!(
            target: LOG_TARGET,
            "listening on tunnel {} at {}:{}", tunnel.nickname, tunnel.host, tunnel.port
        );

        Ok(BobListener {
            local: I2pAddress::new(tunnel.destination, None),
            nickname: tunnel.nickname,
            listener,
            guard,
        })
    }
}

/// Removes a tunnel this process created once its last user is dropped
pub struct TunnelGuard {
    client: BobClient,
    nickname: String,
}

impl fmt::Debug for TunnelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelGuard")
            .field("nickname", &self.nickname)
            .finish()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if !self.client.release(&self.nickname) {
            debug!(target: LOG_TARGET, "tunnel {} still in use", self.nickname);
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!(target: LOG_TARGET, "no runtime to remove tunnel {}", self.nickname);
            return;
        };

        let client = self.client.clone();
        let nickname = std::mem::take(&mut self.nickname);
        handle.spawn(async move {
            match client.remove_tunnel(&nickname).await {
                Ok(true) => debug!(target: LOG_TARGET, "tunnel {} removed", nickname),
                Ok(false) => debug!(target: LOG_TARGET, "tunnel {} was already gone", nickname),
                Err(e) => warn!(target: LOG_TARGET, "failed to remove tunnel {}: {}", nickname, e),
            }
        });
    }
}

/// Local end of a BOB server tunnel
pub struct BobListener {
    local: I2pAddress,
    nickname: String,
    listener: TcpListener,
    guard: Option<TunnelGuard>,
}

impl BobListener {
    /// The I2P address peers connect to
    pub fn local_addr(&self) -> &I2pAddress {
        &self.local
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Wait for the next inbound connection and read its peer preamble
    pub async fn accept(&self) -> Result<I2pStream> {
        let (mut socket, _) = self.listener.accept().await?;
        let mut buffer = BytesMut::new();
        let peer = read_peer_line(&mut socket, &mut buffer).await?;
        let peer = I2pAddress::new(peer.destination, peer.from_port);

        debug!(target: LOG_TARGET, "inbound connection from {}", peer);
        Ok(I2pStream::new(
            Box::new(socket),
            buffer,
            self.local.clone(),
            peer,
            StreamGuard::None,
        ))
    }

    /// Stop serving and remove the tunnel if this process created it
    pub fn close(self) {
        drop(self);
    }

    /// Whether closing removes the tunnel
    pub fn owns_tunnel(&self) -> bool {
        self.guard.is_some()
    }
}

impl fmt::Debug for BobListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BobListener")
            .field("local", &self.local)
            .field("nickname", &self.nickname)
            .finish()
    }
}
