//! weir Core - Shared vocabulary for the transport
//!
//! This crate defines the types used throughout weir:
//! - Errors and close causes (WeirError, CloseReason)
//! - Configuration (NetConfig)
//! - Peer naming and normalization (PeerName)
//! - The application boundary (Handler, Network)
//! - Transport counters (NetworkStats)

pub mod config;
pub mod error;
pub mod handler;
pub mod peer;
pub mod stats;

pub use config::*;
pub use error::*;
pub use handler::*;
pub use peer::*;
pub use stats::*;
