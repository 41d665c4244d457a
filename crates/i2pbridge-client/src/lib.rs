//! I2P router control clients
//!
//! Drives the BOB and SAM v3 control protocols to create tunnels, sessions
//! and streams. Each negotiation is a sans-IO state machine ([`driver`])
//! run over a [`transport::ControlStream`]; established streams come back as
//! [`I2pStream`]s carrying I2P addressing.

pub mod allocator;
pub mod api;
pub mod bob;
pub mod config;
pub mod driver;
pub mod error;
pub mod keepalive;
pub mod keyfile;
pub mod sam;
pub mod session;
pub mod transport;
pub mod wrapper;

pub use api::Api;
pub use bob::{BobClient, BobListener, TunnelOptions};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result, RouterErrorKind};
pub use sam::{SamClient, SessionOptions, SessionStyle, StreamListener};
pub use session::{Session, SessionRegistry};
pub use transport::{ControlStream, Connector, TcpConnector};
pub use wrapper::I2pStream;

pub use i2pbridge_protocol::{I2pAddress, SamVersion};
