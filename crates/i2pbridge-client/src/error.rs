//! Client error types

use std::fmt;
use std::io;
use std::path::PathBuf;

use i2pbridge_protocol::{GrammarError, SamResult};
use thiserror::Error;

/// Failure reported by the router itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterErrorKind {
    /// `CANT_REACH_PEER`, `PEER_NOT_FOUND`
    PeerUnreachable,
    /// `DUPLICATED_DEST`
    DuplicateDestination,
    /// `DUPLICATED_ID`
    DuplicateId,
    /// `I2P_ERROR`
    RouterFailure,
    /// `INVALID_KEY`
    InvalidKey,
    /// `INVALID_ID`
    InvalidId,
    /// `KEY_NOT_FOUND`
    NameNotFound,
    /// `TIMEOUT`
    Timeout,
    /// `ALREADY_ACCEPTING`
    AlreadyAccepting,
    /// BOB could not resolve the target
    UnknownHost,
    /// BOB failed for any other reason
    ConnectFailed,
    /// Result code without a dedicated mapping
    Other,
}

impl RouterErrorKind {
    /// Map a SAM `RESULT=` code
    pub fn from_sam(result: &SamResult) -> Self {
        match result {
            SamResult::CantReachPeer | SamResult::PeerNotFound => RouterErrorKind::PeerUnreachable,
            SamResult::DuplicatedDest => RouterErrorKind::DuplicateDestination,
            SamResult::DuplicatedId => RouterErrorKind::DuplicateId,
            SamResult::I2pError => RouterErrorKind::RouterFailure,
            SamResult::InvalidKey => RouterErrorKind::InvalidKey,
            SamResult::InvalidId => RouterErrorKind::InvalidId,
            SamResult::KeyNotFound => RouterErrorKind::NameNotFound,
            SamResult::Timeout => RouterErrorKind::Timeout,
            SamResult::AlreadyAccepting => RouterErrorKind::AlreadyAccepting,
            SamResult::Ok | SamResult::Unknown(_) => RouterErrorKind::Other,
        }
    }
}

impl fmt::Display for RouterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouterErrorKind::PeerUnreachable => "peer unreachable",
            RouterErrorKind::DuplicateDestination => "duplicate destination",
            RouterErrorKind::DuplicateId => "duplicate id",
            RouterErrorKind::RouterFailure => "router failure",
            RouterErrorKind::InvalidKey => "invalid key",
            RouterErrorKind::InvalidId => "invalid id",
            RouterErrorKind::NameNotFound => "name not found",
            RouterErrorKind::Timeout => "timeout",
            RouterErrorKind::AlreadyAccepting => "already accepting",
            RouterErrorKind::UnknownHost => "unknown host",
            RouterErrorKind::ConnectFailed => "connect failed",
            RouterErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Message fragments BOB uses when a destination cannot be resolved
const BOB_UNKNOWN_HOST: &[&str] = &["Can't find destination", "Destination not found"];

/// Best-effort classification of a free-text BOB `ERROR` line.
///
/// BOB has no structured error codes, so this only recognises the
/// handful of messages known to mean the target could not be resolved.
pub fn classify_bob_error(message: &str) -> RouterErrorKind {
    if BOB_UNKNOWN_HOST.iter().any(|fragment| message.contains(fragment)) {
        RouterErrorKind::UnknownHost
    } else {
        RouterErrorKind::ConnectFailed
    }
}

/// Errors raised while negotiating with the router
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Router error ({kind}): {message}")]
    Router {
        kind: RouterErrorKind,
        message: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("Keyfile already exists: {}", .0.display())]
    KeyfileExists(PathBuf),

    #[error("Keyfile error: {0}")]
    Keyfile(io::Error),

    #[error("Gave up after {0} retries")]
    RetryLimit(u32),

    #[error("Unsupported session style: {0}")]
    UnsupportedStyle(String),

    #[error("Timed out")]
    Timeout,

    #[error("No free port pair for a new tunnel")]
    NoFreePorts,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Router failure from a SAM reply
    pub fn sam(result: &SamResult, message: Option<&str>) -> Self {
        BridgeError::Router {
            kind: RouterErrorKind::from_sam(result),
            message: message.unwrap_or(result.as_str()).to_string(),
        }
    }

    /// Router failure from a BOB `ERROR` line
    pub fn bob(message: &str) -> Self {
        BridgeError::Router {
            kind: classify_bob_error(message),
            message: message.to_string(),
        }
    }

    /// Whether the caller gave up rather than the network failing
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }

    /// Copy of this error for fanning one outcome out to several waiters
    pub(crate) fn replicate(&self) -> Self {
        let io_copy = |e: &io::Error| io::Error::new(e.kind(), e.to_string());
        match self {
            BridgeError::Connection(e) => BridgeError::Connection(io_copy(e)),
            BridgeError::Protocol(m) => BridgeError::Protocol(m.clone()),
            BridgeError::Router { kind, message } => BridgeError::Router {
                kind: *kind,
                message: message.clone(),
            },
            BridgeError::Cancelled => BridgeError::Cancelled,
            BridgeError::SessionClosed => BridgeError::SessionClosed,
            BridgeError::KeyfileExists(p) => BridgeError::KeyfileExists(p.clone()),
            BridgeError::Keyfile(e) => BridgeError::Keyfile(io_copy(e)),
            BridgeError::RetryLimit(n) => BridgeError::RetryLimit(*n),
            BridgeError::UnsupportedStyle(s) => BridgeError::UnsupportedStyle(s.clone()),
            BridgeError::Timeout => BridgeError::Timeout,
            BridgeError::NoFreePorts => BridgeError::NoFreePorts,
            BridgeError::Config(m) => BridgeError::Config(m.clone()),
        }
    }
}

impl From<GrammarError> for BridgeError {
    fn from(e: GrammarError) -> Self {
        BridgeError::Protocol(e.to_string())
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sam_result_mapping() {
        assert_eq!(
            RouterErrorKind::from_sam(&SamResult::CantReachPeer),
            RouterErrorKind::PeerUnreachable
        );
        assert_eq!(
            RouterErrorKind::from_sam(&SamResult::PeerNotFound),
            RouterErrorKind::PeerUnreachable
        );
        assert_eq!(
            RouterErrorKind::from_sam(&SamResult::KeyNotFound),
            RouterErrorKind::NameNotFound
        );
        assert_eq!(
            RouterErrorKind::from_sam(&SamResult::Unknown("NOVERSION".into())),
            RouterErrorKind::Other
        );
    }

    #[test]
    fn test_bob_classification() {
        assert_eq!(
            classify_bob_error("Can't find destination: spam.i2p"),
            RouterErrorKind::UnknownHost
        );
        assert_eq!(classify_bob_error("tunnel settings in use"), RouterErrorKind::ConnectFailed);
    }

    #[test]
    fn test_sam_error_message_falls_back_to_code() {
        match BridgeError::sam(&SamResult::Timeout, None) {
            BridgeError::Router { kind, message } => {
                assert_eq!(kind, RouterErrorKind::Timeout);
                assert_eq!(message, "TIMEOUT");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_replicate_keeps_kind() {
        let original = BridgeError::Connection(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        match original.replicate() {
            BridgeError::Connection(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(BridgeError::Cancelled.replicate().is_cancelled());
    }
}
