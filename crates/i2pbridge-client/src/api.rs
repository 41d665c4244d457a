//! Router API selection

use std::fmt;
use std::str::FromStr;

use crate::bob::BobClient;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::sam::SamClient;

/// Control protocol used to talk to the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Bob,
    Sam,
}

impl Api {
    /// Every supported API, in order of preference
    pub const ALL: [Api; 2] = [Api::Sam, Api::Bob];

    pub fn as_str(&self) -> &'static str {
        match self {
            Api::Bob => "BOB",
            Api::Sam => "SAM",
        }
    }

    /// Conventional control endpoint of a local router
    pub fn default_address(&self) -> &'static str {
        match self {
            Api::Bob => "127.0.0.1:2827",
            Api::Sam => "127.0.0.1:7656",
        }
    }

    /// Configured control endpoint
    pub fn address<'a>(&self, config: &'a BridgeConfig) -> &'a str {
        match self {
            Api::Bob => &config.bob.address,
            Api::Sam => &config.sam.address,
        }
    }

    /// Check the API answers; returns the version it reports
    pub async fn test(&self, config: &BridgeConfig) -> Result<String> {
        match self {
            Api::Bob => BobClient::tcp(config).probe().await,
            Api::Sam => SamClient::tcp(config)
                .test_api()
                .await
                .map(|version| version.to_string()),
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Api {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BOB" => Ok(Api::Bob),
            "SAM" => Ok(Api::Sam),
            _ => Err(BridgeError::Config(format!("Unknown API: {}", s))),
        }
    }
}
