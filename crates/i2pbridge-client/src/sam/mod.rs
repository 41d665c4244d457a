//! SAM (Simple Anonymous Messaging) v3 protocol support

pub mod client;
mod control;
pub mod receiver;
pub mod sender;

pub use client::{SamClient, SessionOptions, StreamHandler, StreamListener};
pub use receiver::VersionRange;
pub use sender::SessionStyle;
