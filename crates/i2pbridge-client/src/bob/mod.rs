//! BOB (Basic Open Bridge) protocol support

pub mod client;
pub mod receiver;
pub mod sender;

pub use client::{BobClient, BobListener, TunnelGuard, TunnelOptions};
pub use receiver::{TunnelInfo, TunnelSpec};
