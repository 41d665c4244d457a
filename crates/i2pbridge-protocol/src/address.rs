//! I2P endpoint addresses

use std::fmt;
use std::hash::{Hash, Hasher};

use data_encoding::{Encoding, Specification};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// Base64 alphabet used by I2P for destinations and keys
pub static I2P_BASE64: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols
        .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
    spec.padding = Some('=');
    spec.encoding()
        .unwrap_or_else(|_| data_encoding::BASE64.clone())
});

/// Lowercase unpadded base32 used for `.b32.i2p` hostnames
pub static I2P_BASE32: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding()
        .unwrap_or_else(|_| data_encoding::BASE32_NOPAD.clone())
});

/// Derive the `.b32.i2p` hostname of a destination.
///
/// The destination is hashed in its decoded binary form; strings that are
/// not valid I2P base64 are hashed as-is.
pub fn b32_host(destination: &str) -> String {
    let digest = match I2P_BASE64.decode(destination.as_bytes()) {
        Ok(decoded) => Sha256::digest(&decoded),
        Err(_) => Sha256::digest(destination.as_bytes()),
    };

    format!("{}.b32.i2p", I2P_BASE32.encode(&digest))
}

/// Address of an I2P endpoint
///
/// Equality and hashing use the canonical host and the port, so an explicit
/// hostname takes precedence over the destination it names.
#[derive(Debug, Clone)]
pub struct I2pAddress {
    /// Opaque destination blob as exchanged with the router
    destination: String,

    /// Explicit hostname or the derived `.b32.i2p` form
    host: String,

    /// Whether `host` was supplied rather than derived
    explicit_host: bool,

    port: Option<u16>,
}

impl I2pAddress {
    /// Address of `destination`, host derived from its hash
    pub fn new(destination: impl Into<String>, port: Option<u16>) -> Self {
        let destination = destination.into();
        let host = b32_host(&destination);

        Self {
            destination,
            host,
            explicit_host: false,
            port,
        }
    }

    /// Address of `destination` known under a human-readable `host`
    pub fn with_host(destination: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            destination: destination.into(),
            host: host.into(),
            explicit_host: true,
            port,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn has_explicit_host(&self) -> bool {
        self.explicit_host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Same destination and host, different port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }
}

impl PartialEq for I2pAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for I2pAddress {}

impl Hash for I2pAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for I2pAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}
