//! i2pbridge wire vocabulary
//!
//! Pure, I/O-free tokenizers for the two line-oriented control protocols
//! spoken by a local I2P router:
//! - BOB (`OK`/`ERROR`/`DATA` framed replies, tunnel status records)
//! - SAM v3 (`KEY=VALUE` reply lines, `PING`/`PONG` keepalive)
//!
//! Also hosts the [`I2pAddress`] value object shared by both protocols.

pub mod address;
pub mod bob;
pub mod error;
pub mod line;
pub mod peer;
pub mod sam;

pub use address::I2pAddress;
pub use bob::{BobReply, BobRule, TunnelStatus};
pub use error::{GrammarError, Result};
pub use line::Parsed;
pub use peer::PeerLine;
pub use sam::{SamReply, SamResult, SamVersion};
