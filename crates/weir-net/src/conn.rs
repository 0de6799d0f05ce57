//! Per-connection state machine
//!
//! A `Connection` owns one nonblocking TCP stream plus everything framed on
//! top of it: the incremental decoder for inbound traffic, the bounded send
//! queue for outbound traffic, and the readiness interest that mirrors both.
//! All methods run on the reactor thread; the only cross-thread surface is
//! the inbox handed into the read path.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::trace;

use weir_core::{CloseReason, NetConfig, NetworkStats, PeerName};
use weir_wire::{encode, framed_len, FrameDecoder};

use crate::delivery::Inbox;

/// Which end initiated the connection. Decides the orientation of the
/// descriptor used to break simultaneous-connect ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Inbound,
    Outbound,
}

/// Lifecycle of the underlying stream.
enum Phase {
    /// Outbound connect in flight; the socket is watched for writability
    /// only and carries its own timeout.
    Connecting { since: Instant },
    Established,
}

pub(crate) struct Connection {
    pub peer: PeerName,
    pub token: Token,
    pub origin: Origin,
    stream: TcpStream,
    /// Remote address as dialed or accepted. Kept separately because
    /// `peer_addr` is unavailable while a connect is still in flight.
    remote: SocketAddr,
    phase: Phase,
    decoder: FrameDecoder,
    send_queue: VecDeque<Bytes>,
    /// Bytes of the front chunk already written to the socket.
    send_offset: usize,
    /// Framed bytes across the whole queue, minus what has been written.
    queued_bytes: usize,
    /// Input throttle. While set, readable events are ignored even though
    /// the readable interest may still be registered.
    read_paused: bool,
    registered: Interest,
    last_activity: Instant,
}

impl Connection {
    /// Wrap an accepted stream. Registers readable interest immediately.
    pub fn inbound(
        peer: PeerName,
        token: Token,
        mut stream: TcpStream,
        remote: SocketAddr,
        registry: &Registry,
        config: &NetConfig,
    ) -> io::Result<Connection> {
        registry.register(&mut stream, token, Interest::READABLE)?;
        Ok(Connection {
            peer,
            token,
            origin: Origin::Inbound,
            stream,
            remote,
            phase: Phase::Established,
            decoder: FrameDecoder::new(config.max_message_size),
            send_queue: VecDeque::new(),
            send_offset: 0,
            queued_bytes: 0,
            read_paused: false,
            registered: Interest::READABLE,
            last_activity: Instant::now(),
        })
    }

    /// Wrap a just-dialed stream. The connect is still in flight; only
    /// writability is watched until it completes.
    pub fn outbound(
        peer: PeerName,
        token: Token,
        mut stream: TcpStream,
        remote: SocketAddr,
        registry: &Registry,
        config: &NetConfig,
    ) -> io::Result<Connection> {
        registry.register(&mut stream, token, Interest::WRITABLE)?;
        Ok(Connection {
            peer,
            token,
            origin: Origin::Outbound,
            stream,
            remote,
            phase: Phase::Connecting {
                since: Instant::now(),
            },
            decoder: FrameDecoder::new(config.max_message_size),
            send_queue: VecDeque::new(),
            send_offset: 0,
            queued_bytes: 0,
            read_paused: false,
            registered: Interest::WRITABLE,
            last_activity: Instant::now(),
        })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.phase, Phase::Connecting { .. })
    }

    pub fn reads_paused(&self) -> bool {
        self.read_paused
    }

    pub fn resume_reads(&mut self) {
        self.read_paused = false;
    }

    pub fn has_pending_output(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Frame and append one message if the queue cap allows it. Returns
    /// false, leaving the queue untouched, when the framed size would push
    /// the queue past `max_output_queue`.
    pub fn enqueue_output(&mut self, payload: &[u8], max_output_queue: usize) -> bool {
        if self.queued_bytes + framed_len(payload.len()) > max_output_queue {
            return false;
        }
        let Ok(chunk) = encode(payload) else {
            return false;
        };
        self.queued_bytes += chunk.len();
        self.send_queue.push_back(chunk);
        self.touch();
        true
    }

    /// Drain the socket into the decoder, pushing completed messages to the
    /// inbox. Stops at the input cap (pausing reads) or on `WouldBlock`.
    /// An error return means the connection must be closed.
    pub fn on_readable(
        &mut self,
        inbox: &Inbox,
        stats: &mut NetworkStats,
    ) -> Result<(), CloseReason> {
        if self.read_paused {
            // Stale readiness from before the throttle engaged.
            return Ok(());
        }
        loop {
            if inbox.over_cap(&self.peer) {
                self.read_paused = true;
                trace!(peer = %self.peer, "input queue full, reads paused");
                return Ok(());
            }
            match self.stream.read(self.decoder.read_target()) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(n) => {
                    stats.bytes_in += n as u64;
                    self.touch();
                    match self.decoder.advance(n) {
                        Ok(Some(message)) => {
                            stats.messages_in += 1;
                            if inbox.push_message(&self.peer, message) {
                                self.read_paused = true;
                                trace!(peer = %self.peer, "input queue full, reads paused");
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return Err(CloseReason::from(e)),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    /// Flush queued output until the socket blocks or the queue empties.
    /// `Ok(true)` reports a queued-to-empty transition on this call.
    pub fn on_writable(&mut self, stats: &mut NetworkStats) -> Result<bool, CloseReason> {
        if self.send_queue.is_empty() {
            return Ok(false);
        }
        loop {
            let Some(front) = self.send_queue.front() else {
                return Ok(true);
            };
            let front_len = front.len();
            match self.stream.write(&front[self.send_offset..]) {
                Ok(0) => {
                    return Err(CloseReason::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection write returned zero",
                    )))
                }
                Ok(n) => {
                    stats.bytes_out += n as u64;
                    self.queued_bytes -= n;
                    self.send_offset += n;
                    self.touch();
                    if self.send_offset == front_len {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    /// First writable event on a connecting socket: resolve the connect.
    pub fn complete_connect(&mut self) -> Result<(), CloseReason> {
        match self.stream.take_error() {
            Ok(None) => {
                self.phase = Phase::Established;
                self.touch();
                Ok(())
            }
            Ok(Some(e)) | Err(e) => Err(CloseReason::Io(e)),
        }
    }

    /// Housekeeping verdict against the connect and idle deadlines.
    pub fn timed_out(&self, now: Instant, config: &NetConfig) -> Option<CloseReason> {
        match self.phase {
            Phase::Connecting { since } => {
                (now.duration_since(since) > config.connect_timeout)
                    .then_some(CloseReason::ConnectTimeout)
            }
            Phase::Established => (now.duration_since(self.last_activity)
                > config.max_idle_time)
                .then_some(CloseReason::IdleTimeout),
        }
    }

    /// Interest that matches the current state. mio refuses an empty
    /// interest set, so a paused connection with nothing to write stays
    /// readable-registered and relies on the pause flag to gate reads.
    fn desired_interest(&self) -> Interest {
        match self.phase {
            Phase::Connecting { .. } => Interest::WRITABLE,
            Phase::Established => match (self.read_paused, self.send_queue.is_empty()) {
                (false, true) => Interest::READABLE,
                (false, false) => Interest::READABLE | Interest::WRITABLE,
                (true, false) => Interest::WRITABLE,
                (true, true) => Interest::READABLE,
            },
        }
    }

    /// Reregister when the desired interest changed. Reregistering also
    /// refires currently-held readiness, which is what flushes a queue
    /// built up while the socket was already writable.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let want = self.desired_interest();
        if want != self.registered {
            registry.reregister(&mut self.stream, self.token, want)?;
            self.registered = want;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!(peer = %self.peer, error = %e, "deregister failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::time::Duration;

    // Builds an established Connection over a real loopback socket pair,
    // without a registry. Interest syncing is exercised separately.
    fn test_conn(config: &NetConfig) -> (Connection, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let stream = TcpStream::from_std(client);
        let peer = PeerName::from_remote(addr, config.default_port);
        let conn = Connection {
            peer,
            token: Token(7),
            origin: Origin::Outbound,
            stream,
            remote: addr,
            phase: Phase::Established,
            decoder: FrameDecoder::new(config.max_message_size),
            send_queue: VecDeque::new(),
            send_offset: 0,
            queued_bytes: 0,
            read_paused: false,
            registered: Interest::READABLE,
            last_activity: Instant::now(),
        };
        (conn, server)
    }

    #[test]
    fn test_enqueue_rejects_exactly_at_cap() {
        let config = NetConfig::small();
        let (mut conn, _server) = test_conn(&config);
        // 20-byte payloads frame to 24 bytes each against a 100-byte cap.
        let payload = [0u8; 20];
        for _ in 0..4 {
            assert!(conn.enqueue_output(&payload, 100));
        }
        assert_eq!(conn.queued_bytes, 96);
        assert!(!conn.enqueue_output(&payload, 100), "fifth message overflows");
        assert_eq!(conn.queued_bytes, 96, "rejected message left no trace");
        assert!(conn.enqueue_output(&[0u8; 0], 100), "empty frame still fits");
    }

    #[test]
    fn test_flush_writes_framed_bytes_and_reports_transition() {
        let config = NetConfig::small();
        let (mut conn, mut server) = test_conn(&config);
        let mut stats = NetworkStats::default();

        assert!(conn.enqueue_output(b"abc", config.max_output_queue));
        assert!(conn.enqueue_output(b"", config.max_output_queue));
        let drained = conn.on_writable(&mut stats).unwrap();
        assert!(drained, "small writes drain in one pass");
        assert!(!conn.has_pending_output());
        assert_eq!(conn.queued_bytes, 0);
        assert_eq!(stats.bytes_out, 11);

        let mut read = [0u8; 11];
        server.read_exact(&mut read).unwrap();
        assert_eq!(&read, &[0, 0, 0, 3, b'a', b'b', b'c', 0, 0, 0, 0]);

        // A spurious writable event after the drain is not a transition.
        assert!(!conn.on_writable(&mut stats).unwrap());
    }

    #[test]
    fn test_read_decodes_across_arbitrary_chunks() {
        let config = NetConfig::small();
        let (mut conn, mut server) = test_conn(&config);
        let mut stats = NetworkStats::default();
        let inbox = Inbox::new(config.max_input_queue);
        inbox.open_slot(&conn.peer);

        server.write_all(&[0, 0, 0]).unwrap();
        conn.on_readable(&inbox, &mut stats).unwrap();
        assert!(inbox.poll_event().is_none(), "header incomplete");

        server.write_all(&[5, b'h', b'e', b'l', b'l', b'o']).unwrap();
        // Wait for the bytes to land in the client-side buffer.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            conn.on_readable(&inbox, &mut stats).unwrap();
            match inbox.poll_event() {
                Some((_, crate::delivery::InboxEvent::Message(m), _)) => {
                    assert_eq!(m, "hello".as_bytes());
                    break;
                }
                _ if Instant::now() > deadline => panic!("message never decoded"),
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(stats.messages_in, 1);
        assert_eq!(stats.bytes_in, 9);
    }

    #[test]
    fn test_read_pauses_at_input_cap() {
        let mut config = NetConfig::small();
        config.max_input_queue = 8;
        let (mut conn, mut server) = test_conn(&config);
        let mut stats = NetworkStats::default();
        let inbox = Inbox::new(config.max_input_queue);
        inbox.open_slot(&conn.peer);

        // Two 8-byte payloads; the first alone reaches the 8-byte cap.
        for _ in 0..2 {
            server
                .write_all(&[0, 0, 0, 8, 1, 2, 3, 4, 5, 6, 7, 8])
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while !conn.reads_paused() {
            assert!(Instant::now() < deadline, "reads never paused");
            conn.on_readable(&inbox, &mut stats).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(inbox.over_cap(&conn.peer));
        // Paused connections ignore further readiness.
        conn.on_readable(&inbox, &mut stats).unwrap();
        assert_eq!(stats.messages_in, 1);
    }

    #[test]
    fn test_peer_close_detected() {
        let config = NetConfig::small();
        let (mut conn, server) = test_conn(&config);
        let mut stats = NetworkStats::default();
        let inbox = Inbox::new(config.max_input_queue);
        inbox.open_slot(&conn.peer);

        drop(server);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match conn.on_readable(&inbox, &mut stats) {
                Err(CloseReason::PeerClosed) => break,
                Ok(()) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                other => panic!("expected peer-closed, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let mut config = NetConfig::small();
        config.max_message_size = 16;
        let (mut conn, mut server) = test_conn(&config);
        conn.decoder = FrameDecoder::new(config.max_message_size);
        let mut stats = NetworkStats::default();
        let inbox = Inbox::new(config.max_input_queue);
        inbox.open_slot(&conn.peer);

        server.write_all(&[0, 0, 1, 0]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match conn.on_readable(&inbox, &mut stats) {
                Err(CloseReason::Framing(_)) => break,
                Ok(()) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                other => panic!("expected framing error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_desired_interest_matrix() {
        let config = NetConfig::small();
        let (mut conn, _server) = test_conn(&config);

        assert_eq!(conn.desired_interest(), Interest::READABLE);
        assert!(conn.enqueue_output(b"x", config.max_output_queue));
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );
        conn.read_paused = true;
        assert_eq!(conn.desired_interest(), Interest::WRITABLE);
        conn.send_queue.clear();
        // Fully quiescent still needs one registered interest.
        assert_eq!(conn.desired_interest(), Interest::READABLE);

        conn.phase = Phase::Connecting {
            since: Instant::now(),
        };
        assert_eq!(conn.desired_interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_timeout_verdicts() {
        let mut config = NetConfig::small();
        config.max_idle_time = Duration::from_millis(10);
        config.connect_timeout = Duration::from_millis(10);
        let (mut conn, _server) = test_conn(&config);

        let now = Instant::now();
        assert!(conn.timed_out(now, &config).is_none());
        let later = now + Duration::from_millis(50);
        assert!(matches!(
            conn.timed_out(later, &config),
            Some(CloseReason::IdleTimeout)
        ));

        conn.phase = Phase::Connecting { since: now };
        assert!(matches!(
            conn.timed_out(later, &config),
            Some(CloseReason::ConnectTimeout)
        ));
    }
}
