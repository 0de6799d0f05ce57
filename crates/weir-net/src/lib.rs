//! weir Net - Framed connections, fair delivery, and the TCP network
//!
//! This crate provides:
//! - Per-connection framing, send queues, and backpressure
//! - The reactor driver owning the peer table and accept loop
//! - A rotating delivery inbox feeding the application handler
//! - `TcpNetwork`, the TCP implementation of the `Network` trait

mod conn;
mod delivery;
mod net;
mod tcp;

pub use tcp::TcpNetwork;
