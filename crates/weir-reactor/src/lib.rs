//! weir Reactor - The readiness-multiplexing service loop
//!
//! One `mio::Poll` owned by one dedicated thread. Everything else reaches
//! the loop through a command channel paired with an unconditional waker:
//! - Registration and interest changes execute as commands on the loop
//! - Readiness events dispatch to a caller-supplied [`Drive`]
//! - A housekeeping hook runs on every pass, so a wake forces it immediately

pub mod handle;
pub mod reactor;

pub use handle::*;
pub use reactor::*;
