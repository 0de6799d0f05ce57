//! End-to-end test harness
//!
//! Spins up real `TcpNetwork` instances on ephemeral loopback ports, records
//! everything their handlers observe, and provides the blocking wait helpers
//! the integration suite leans on. The suite itself lives at the bottom of
//! this file.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use weir_core::{Handler, NetConfig, Network, NetworkStats, WeirResult};
use weir_net::TcpNetwork;

// ============================================================================
// RECORDING HANDLER
// ============================================================================

/// One observed transport event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A message from `peer` with the given payload.
    Message { peer: String, payload: Vec<u8> },
    /// The output queue toward `peer` drained to empty.
    OutputEmpty { peer: String },
}

/// Handler that records every event and wakes blocked waiters. An optional
/// artificial delay per message simulates a slow consumer.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
    delay: Mutex<Duration>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    /// Sleep this long inside every `on_message` before recording.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Snapshot of all events observed so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Message { .. }))
            .count()
    }

    /// Payloads received from one peer, in arrival order.
    pub fn messages_from(&self, peer: &str) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Message { peer: p, payload } if p == peer => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn output_empty_count(&self, peer: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::OutputEmpty { peer: p } if p == peer))
            .count()
    }

    /// Block until the predicate holds over the recorded events, panicking
    /// with the collected events when `timeout` passes first.
    pub fn wait_until(
        &self,
        what: &str,
        timeout: Duration,
        cond: impl Fn(&[Event]) -> bool,
    ) {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !cond(&events) {
            let now = Instant::now();
            if now >= deadline {
                panic!("timed out waiting for {what}; events: {:?}", *events);
            }
            self.changed.wait_for(&mut events, deadline - now);
        }
    }

    pub fn wait_for_message_count(&self, n: usize, timeout: Duration) {
        self.wait_until(&format!("{n} messages"), timeout, |events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Message { .. }))
                .count()
                >= n
        });
    }

    pub fn wait_for_output_empty(&self, peer: &str, timeout: Duration) {
        let what = format!("output-empty notification for {peer}");
        self.wait_until(&what, timeout, |events| {
            events
                .iter()
                .any(|e| matches!(e, Event::OutputEmpty { peer: p } if p == peer))
        });
    }
}

impl Handler for Recorder {
    fn on_message(&self, peer: &str, message: &[u8]) -> WeirResult<()> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut events = self.events.lock();
        events.push(Event::Message {
            peer: peer.to_string(),
            payload: message.to_vec(),
        });
        self.changed.notify_all();
        Ok(())
    }

    fn on_output_empty(&self, peer: &str) -> WeirResult<()> {
        let mut events = self.events.lock();
        events.push(Event::OutputEmpty {
            peer: peer.to_string(),
        });
        self.changed.notify_all();
        Ok(())
    }
}

// ============================================================================
// TEST NODE
// ============================================================================

/// One running transport instance with its recorder.
pub struct TestNode {
    pub net: TcpNetwork,
    pub recorder: Arc<Recorder>,
}

impl TestNode {
    /// Start a node on an ephemeral loopback port.
    pub fn start(config: NetConfig) -> TestNode {
        Self::start_on("127.0.0.1:0".parse().unwrap(), config)
    }

    pub fn start_default() -> TestNode {
        Self::start(NetConfig::small())
    }

    /// Start a node on a specific address.
    pub fn start_on(addr: SocketAddr, config: NetConfig) -> TestNode {
        init_logging();
        let net = TcpNetwork::bind(addr, config);
        let recorder = Recorder::new();
        net.start(recorder.clone()).expect("network start");
        TestNode { net, recorder }
    }

    /// The bound loopback address other nodes dial.
    pub fn addr(&self) -> SocketAddr {
        self.net.local_addr().expect("node is running")
    }

    /// `host:port` peer name of this node.
    pub fn name(&self) -> String {
        self.addr().to_string()
    }

    pub fn send_to(&self, other: &TestNode, payload: &[u8]) -> bool {
        self.net.send(&other.name(), payload)
    }

    pub fn stats(&self) -> NetworkStats {
        self.net.stats()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Poll a condition until it holds, panicking when `timeout` passes first.
pub fn poll_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// A port that was free a moment ago. Bound and released, so a racing
/// process could in principle grab it; good enough for tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Install the fmt subscriber once for the whole test binary; honors
/// `RUST_LOG`.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// INTEGRATION SUITE
// ============================================================================
