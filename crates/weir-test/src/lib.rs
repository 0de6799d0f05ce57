//! weir Test - End-to-end harness for the transport
//!
//! Real `TcpNetwork` instances wired together over loopback:
//! - A recording handler with blocking wait helpers
//! - `TestNode`, one running network on an ephemeral port
//! - The integration suite exercising send, delivery, backpressure,
//!   timeouts, and duplicate-connection convergence

pub mod harness;

pub use harness::*;
