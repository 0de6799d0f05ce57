//! The boundary between the transport and application code
//!
//! Both callbacks run on the network's delivery thread, outside any
//! transport lock, so implementations may freely call back into the
//! network (including `send`) without deadlocking the reactor.

use std::sync::Arc;

use crate::{NetworkStats, WeirResult};

/// Application-side sink for transport events.
pub trait Handler: Send + Sync {
    /// Called once per received message, in per-connection arrival order.
    /// The bytes are only valid for the duration of the call.
    fn on_message(&self, peer: &str, message: &[u8]) -> WeirResult<()>;

    /// Called once per transition of the peer's output queue from non-empty
    /// to empty. Fires at least once shortly after a successful first send
    /// to a new peer, and once more after a connection closes with a flush
    /// still pending. Errors are logged and swallowed.
    fn on_output_empty(&self, peer: &str) -> WeirResult<()>;
}

/// Message-oriented transport lifecycle.
pub trait Network {
    /// Begin operation. Idempotent; only multiplexer or listener creation
    /// failures surface here.
    fn start(&self, handler: Arc<dyn Handler>) -> WeirResult<()>;

    /// Idempotent shutdown; closes every connection and stops both service
    /// threads. Safe to call from inside a handler callback.
    fn stop(&self);

    /// Queue a message for a peer, creating the connection if none exists.
    /// Never blocks on I/O. False means the message was rejected locally:
    /// queue full, connection creation failed, or instance not running.
    fn send(&self, peer: &str, message: &[u8]) -> bool;

    /// Snapshot of the transport counters.
    fn stats(&self) -> NetworkStats;
}
