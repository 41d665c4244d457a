//! Client configuration

use std::fs;
use std::path::Path;
use std::time::Duration;

use i2pbridge_protocol::SamVersion;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bob: BobConfig,
    pub sam: SamConfig,
    pub keepalive: KeepaliveConfig,
    pub timeouts: TimeoutConfig,

    /// Prefix of generated tunnel and session nicknames
    pub nickname_prefix: String,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BobConfig {
    /// BOB control endpoint
    pub address: String,

    /// Cap on `tunnel is active` retries, unbounded when unset
    pub retry_limit: Option<u32>,

    /// Host BOB listens on for client tunnels
    pub inhost: String,

    /// Host BOB forwards server tunnel traffic to
    pub outhost: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamConfig {
    /// SAM control endpoint
    pub address: String,

    pub min_version: SamVersion,
    pub max_version: SamVersion,

    /// Signature type requested for new destinations; the router default
    /// fallback chain is used when unset
    pub signature_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Opening a control connection
    pub connect_secs: u64,

    /// A complete negotiation on an open control connection
    pub negotiation_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bob: BobConfig::default(),
            sam: SamConfig::default(),
            keepalive: KeepaliveConfig::default(),
            timeouts: TimeoutConfig::default(),
            nickname_prefix: "i2pbridge".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BobConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2827".to_string(),
            retry_limit: None,
            inhost: "localhost".to_string(),
            outhost: "localhost".to_string(),
        }
    }
}

impl Default for SamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7656".to_string(),
            min_version: SamVersion::new(3, 0),
            max_version: SamVersion::new(3, 3),
            signature_type: None,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 120,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 30,
            negotiation_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: BridgeConfig = serde_yaml::from_str(contents)
            .map_err(|e| BridgeError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.sam.min_version > self.sam.max_version {
            return Err(BridgeError::Config(format!(
                "SAM min_version {} is newer than max_version {}",
                self.sam.min_version, self.sam.max_version
            )));
        }
        if self.keepalive.interval_secs == 0 || self.keepalive.timeout_secs == 0 {
            return Err(BridgeError::Config(
                "Keepalive interval and timeout must be non-zero".to_string(),
            ));
        }
        if self.nickname_prefix.contains(char::is_whitespace) {
            return Err(BridgeError::Config(
                "Nickname prefix must not contain whitespace".to_string(),
            ));
        }

        Ok(())
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn negotiation(&self) -> Duration {
        Duration::from_secs(self.negotiation_secs)
    }
}
