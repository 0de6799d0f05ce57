//! Transport configuration

use std::time::Duration;

/// Configuration for a weir network instance.
///
/// All caps are per-connection except `max_connections`. Byte caps on the
/// output side are measured in framed bytes (payload plus the 4-byte length
/// header); the input cap is measured in payload bytes.
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Maximum concurrent peer-table entries; excess inbound connections are
    /// left unaccepted until room opens up.
    pub max_connections: usize,
    /// Established connections inactive longer than this are closed.
    pub max_idle_time: Duration,
    /// Incoming frames declaring a larger payload are a fatal framing error.
    pub max_message_size: usize,
    /// Cap on queued framed output bytes; crossing it makes `send` fail.
    pub max_output_queue: usize,
    /// Cap on queued input payload bytes; reaching it throttles reads.
    pub max_input_queue: usize,
    /// Time allowed for an outbound connect to complete.
    pub connect_timeout: Duration,
    /// Upper bound on how long the reactor sleeps between housekeeping
    /// passes absent an explicit wakeup.
    pub housekeeping_interval: Duration,
    /// Appended to peer names lacking a port, and used to derive the peer
    /// identity of inbound connections. 0 disables both behaviors.
    pub default_port: u16,
    /// Sets TCP_NODELAY on every socket.
    pub no_delay: bool,
    /// When set, enables SO_KEEPALIVE with the given idle period.
    pub keep_alive: Option<Duration>,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_connections: 256,
            max_idle_time: Duration::from_secs(300),
            max_message_size: 1024 * 1024,
            max_output_queue: 1024 * 1024,
            max_input_queue: 1024 * 1024,
            connect_timeout: Duration::from_secs(30),
            housekeeping_interval: Duration::from_millis(250),
            default_port: 0,
            no_delay: true,
            keep_alive: None,
        }
    }
}

impl NetConfig {
    /// Configuration suited to unit tests: short timeouts, small queues.
    pub fn small() -> Self {
        NetConfig {
            max_connections: 8,
            max_idle_time: Duration::from_secs(5),
            max_message_size: 64 * 1024,
            max_output_queue: 64 * 1024,
            max_input_queue: 64 * 1024,
            connect_timeout: Duration::from_secs(2),
            housekeeping_interval: Duration::from_millis(25),
            ..NetConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let cfg = NetConfig::default();
        assert!(cfg.max_connections > 0);
        assert!(cfg.connect_timeout < cfg.max_idle_time);
        assert!(cfg.housekeeping_interval < cfg.connect_timeout);
    }
}
