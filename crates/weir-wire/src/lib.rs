//! weir Wire - Length-prefix framing
//!
//! This crate implements the wire format shared by every weir connection:
//! - Encoding: `<4-byte big-endian signed length N><N bytes of payload>`
//! - Incremental decoding driven directly by non-blocking socket reads

pub mod decode;
pub mod frame;

pub use decode::*;
pub use frame::*;
