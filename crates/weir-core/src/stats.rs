//! Transport counters

/// Counters maintained by the reactor driver; snapshots are fetched with a
/// command round-trip, so a snapshot is internally consistent.
#[derive(Clone, Debug, Default)]
pub struct NetworkStats {
    /// Frames decoded and queued for delivery.
    pub messages_in: u64,
    /// Messages accepted by `send`.
    pub messages_out: u64,
    /// Raw bytes read off sockets.
    pub bytes_in: u64,
    /// Raw bytes written to sockets.
    pub bytes_out: u64,
    /// Connections that reached the peer table (either direction).
    pub connections_opened: u64,
    /// Connections torn down, whatever the cause.
    pub connections_closed: u64,
    /// `send` calls rejected on the reactor side: queue cap reached or
    /// connection creation failed.
    pub sends_rejected: u64,
    /// Live peer-table entries at snapshot time.
    pub active_connections: usize,
}
