//! Delivery inbox and the thread that drains it
//!
//! The reactor thread pushes decoded messages and queue-state transitions
//! into per-peer slots; a single delivery thread pops one event at a time,
//! rotating across peers, and invokes the application handler outside the
//! lock. Handler latency therefore never blocks socket I/O, and one noisy
//! peer cannot starve the others.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use weir_core::{Handler, PeerName, WeirResult};
use weir_reactor::ReactorHandle;

use crate::net::Command;

/// Pending work for one peer.
#[derive(Default)]
struct PeerSlot {
    /// Decoded messages in arrival order.
    messages: VecDeque<Bytes>,
    /// Payload bytes held in `messages`; compared against the input cap.
    queued_bytes: usize,
    /// Set when the connection's send queue drained to empty; cleared on
    /// delivery so each transition notifies exactly once.
    output_empty_pending: bool,
    /// The connection is gone; the slot lingers only to flush a pending
    /// notification, then disappears.
    closed: bool,
}

impl PeerSlot {
    fn has_work(&self) -> bool {
        !self.messages.is_empty() || self.output_empty_pending
    }

    fn spent(&self) -> bool {
        self.closed && !self.has_work()
    }
}

struct InboxState {
    slots: HashMap<PeerName, PeerSlot>,
    /// Rotation order, oldest connection first.
    order: Vec<PeerName>,
    /// Monotonic scan offset; taken modulo the live slot count each scan.
    cursor: usize,
    stopping: bool,
}

/// One delivered event.
pub(crate) enum InboxEvent {
    Message(Bytes),
    OutputEmpty,
}

/// Shared mailbox between the reactor thread (producer) and the delivery
/// thread (consumer).
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
    max_input_queue: usize,
}

impl Inbox {
    pub fn new(max_input_queue: usize) -> Arc<Inbox> {
        Arc::new(Inbox {
            state: Mutex::new(InboxState {
                slots: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
                stopping: false,
            }),
            ready: Condvar::new(),
            max_input_queue,
        })
    }

    /// Create (or revive) the slot for a connection entering the peer table.
    /// A revived slot keeps a pending notification from its predecessor.
    pub fn open_slot(&self, peer: &PeerName) {
        let mut state = self.state.lock();
        match state.slots.get_mut(peer) {
            Some(slot) => slot.closed = false,
            None => {
                state.slots.insert(peer.clone(), PeerSlot::default());
                state.order.push(peer.clone());
            }
        }
    }

    /// Append a decoded message. Returns true when the peer's input queue
    /// has reached its cap and reads should be throttled.
    pub fn push_message(&self, peer: &PeerName, message: Bytes) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(peer) else {
            // Connection already torn down; the message dies with it.
            return false;
        };
        let was_idle = !slot.has_work();
        slot.queued_bytes += message.len();
        slot.messages.push_back(message);
        let throttle = slot.queued_bytes >= self.max_input_queue;
        if was_idle {
            self.ready.notify_one();
        }
        throttle
    }

    /// Record a queued-to-empty transition of the peer's send queue.
    /// Deduplicated: re-arming before delivery is a no-op.
    pub fn arm_output_empty(&self, peer: &PeerName) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(peer) else {
            return;
        };
        if slot.output_empty_pending {
            return;
        }
        let was_idle = !slot.has_work();
        slot.output_empty_pending = true;
        if was_idle {
            self.ready.notify_one();
        }
    }

    /// The connection left the peer table. Undelivered input is dropped;
    /// a pending flush still owes its notification, so the slot survives
    /// until that has been delivered.
    pub fn close_slot(&self, peer: &PeerName, flush_pending: bool) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(peer) else {
            return;
        };
        slot.messages.clear();
        slot.queued_bytes = 0;
        slot.closed = true;
        if flush_pending {
            slot.output_empty_pending = true;
        }
        if slot.output_empty_pending {
            self.ready.notify_one();
        }
    }

    /// Reactor-side throttle check for the read loop.
    pub fn over_cap(&self, peer: &PeerName) -> bool {
        let state = self.state.lock();
        state
            .slots
            .get(peer)
            .map(|slot| slot.queued_bytes >= self.max_input_queue)
            .unwrap_or(false)
    }

    /// Unblock the delivery thread and make `next_event` return `None`.
    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.ready.notify_all();
    }

    /// Block until an event is available. `None` means the inbox has shut
    /// down. The resume flag is true when this pop moved the peer's input
    /// queue back under its cap.
    fn next_event(&self) -> Option<(PeerName, InboxEvent, bool)> {
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return None;
            }
            if let Some(found) = self.pop_locked(&mut state) {
                return Some(found);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking pop, used directly by tests.
    pub fn poll_event(&self) -> Option<(PeerName, InboxEvent, bool)> {
        let mut state = self.state.lock();
        self.pop_locked(&mut state)
    }

    /// One rotation step: drop spent slots, then scan from the cursor for
    /// the first slot with work and take exactly one event from it.
    fn pop_locked(&self, state: &mut InboxState) -> Option<(PeerName, InboxEvent, bool)> {
        let InboxState {
            slots,
            order,
            cursor,
            ..
        } = state;

        if order.iter().any(|p| slots.get(p).map_or(true, PeerSlot::spent)) {
            order.retain(|p| match slots.get(p) {
                Some(slot) if !slot.spent() => true,
                _ => {
                    slots.remove(p);
                    false
                }
            });
        }

        let n = order.len();
        if n == 0 {
            return None;
        }
        let start = *cursor % n;
        for i in 0..n {
            let idx = (start + i) % n;
            let peer = order[idx].clone();
            let Some(slot) = slots.get_mut(&peer) else {
                continue;
            };
            if let Some(message) = slot.messages.pop_front() {
                let was_at_cap = slot.queued_bytes >= self.max_input_queue;
                slot.queued_bytes -= message.len();
                let resume = was_at_cap && slot.queued_bytes < self.max_input_queue;
                *cursor = start + i + 1;
                return Some((peer, InboxEvent::Message(message), resume));
            }
            if slot.output_empty_pending {
                slot.output_empty_pending = false;
                *cursor = start + i + 1;
                return Some((peer, InboxEvent::OutputEmpty, false));
            }
        }
        None
    }
}

/// Owner of the delivery thread.
pub(crate) struct DeliveryThread {
    inbox: Arc<Inbox>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryThread {
    pub fn spawn(
        inbox: Arc<Inbox>,
        handler: Arc<dyn Handler>,
        reactor: ReactorHandle<Command>,
    ) -> WeirResult<DeliveryThread> {
        let worker_inbox = Arc::clone(&inbox);
        let thread = thread::Builder::new()
            .name("weir-delivery".to_string())
            .spawn(move || run(worker_inbox, handler, reactor))?;
        let thread_id = thread.thread().id();
        Ok(DeliveryThread {
            inbox,
            thread_id,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Signal the loop and join it. Safe to call from inside a handler
    /// callback; the self-join is skipped and the loop exits on its own
    /// once the callback returns.
    pub fn stop(&self) {
        self.inbox.shut_down();
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("delivery thread panicked");
            }
        }
    }
}

fn run(inbox: Arc<Inbox>, handler: Arc<dyn Handler>, reactor: ReactorHandle<Command>) {
    debug!("delivery loop running");
    while let Some((peer, event, resume)) = inbox.next_event() {
        if resume {
            // Unthrottle before running the handler so the socket refills
            // while the application is busy.
            reactor.send(Command::ResumeRead { peer: peer.clone() });
        }
        match event {
            InboxEvent::Message(message) => {
                trace!(peer = %peer, len = message.len(), "delivering message");
                if let Err(e) = handler.on_message(peer.as_str(), &message) {
                    error!(peer = %peer, error = %e, "message handler failed");
                }
            }
            InboxEvent::OutputEmpty => {
                trace!(peer = %peer, "delivering output-empty notification");
                if let Err(e) = handler.on_output_empty(peer.as_str()) {
                    error!(peer = %peer, error = %e, "output-empty handler failed");
                }
            }
        }
    }
    debug!("delivery loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerName {
        PeerName::normalize(name, 9000).unwrap()
    }

    fn msg(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn expect_message(inbox: &Inbox) -> (PeerName, Bytes, bool) {
        match inbox.poll_event() {
            Some((p, InboxEvent::Message(m), resume)) => (p, m, resume),
            Some((_, InboxEvent::OutputEmpty, _)) => panic!("expected message, got output-empty"),
            None => panic!("expected message, inbox empty"),
        }
    }

    #[test]
    fn test_fifo_within_peer() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.push_message(&a, msg("one"));
        inbox.push_message(&a, msg("two"));
        inbox.push_message(&a, msg("three"));

        for expected in ["one", "two", "three"] {
            let (_, m, _) = expect_message(&inbox);
            assert_eq!(m, expected.as_bytes());
        }
        assert!(inbox.poll_event().is_none());
    }

    #[test]
    fn test_rotation_alternates_between_busy_peers() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        let b = peer("b");
        inbox.open_slot(&a);
        inbox.open_slot(&b);
        for i in 0..3 {
            inbox.push_message(&a, msg(&format!("a{i}")));
            inbox.push_message(&b, msg(&format!("b{i}")));
        }

        let mut sources = Vec::new();
        while let Some((p, _, _)) = inbox.poll_event() {
            sources.push(p.as_str().to_string());
        }
        // One event per peer per rotation, never two in a row while both
        // have work.
        assert_eq!(sources.len(), 6);
        for pair in sources.windows(2).take(5) {
            assert_ne!(pair[0], pair[1], "rotation served {pair:?} back to back");
        }
    }

    #[test]
    fn test_output_empty_deduplicates_until_delivered() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.arm_output_empty(&a);
        inbox.arm_output_empty(&a);

        assert!(matches!(
            inbox.poll_event(),
            Some((_, InboxEvent::OutputEmpty, false))
        ));
        assert!(inbox.poll_event().is_none());

        // A fresh transition after delivery notifies again.
        inbox.arm_output_empty(&a);
        assert!(matches!(
            inbox.poll_event(),
            Some((_, InboxEvent::OutputEmpty, false))
        ));
    }

    #[test]
    fn test_messages_delivered_before_output_empty() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.push_message(&a, msg("payload"));
        inbox.arm_output_empty(&a);

        let (_, m, _) = expect_message(&inbox);
        assert_eq!(m, "payload".as_bytes());
        assert!(matches!(
            inbox.poll_event(),
            Some((_, InboxEvent::OutputEmpty, _))
        ));
    }

    #[test]
    fn test_resume_flag_on_crossing_back_under_cap() {
        let inbox = Inbox::new(10);
        let a = peer("a");
        inbox.open_slot(&a);
        assert!(!inbox.push_message(&a, msg("1234")));
        assert!(inbox.push_message(&a, msg("567890x")), "cap reached");
        assert!(inbox.over_cap(&a));

        let (_, _, resume) = expect_message(&inbox);
        assert!(resume, "first pop under the cap requests a resume");
        assert!(!inbox.over_cap(&a));
        let (_, _, resume) = expect_message(&inbox);
        assert!(!resume, "already under the cap, no second resume");
    }

    #[test]
    fn test_close_drops_messages_but_flushes_pending_notification() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.push_message(&a, msg("never delivered"));
        inbox.close_slot(&a, true);

        assert!(matches!(
            inbox.poll_event(),
            Some((_, InboxEvent::OutputEmpty, _))
        ));
        // Slot is spent and disappears; later pushes find no slot.
        assert!(inbox.poll_event().is_none());
        assert!(!inbox.push_message(&a, msg("late")));
        assert!(inbox.poll_event().is_none());
    }

    #[test]
    fn test_close_without_pending_flush_is_silent() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.push_message(&a, msg("dropped"));
        inbox.close_slot(&a, false);
        assert!(inbox.poll_event().is_none());
    }

    #[test]
    fn test_reopened_slot_keeps_pending_notification() {
        let inbox = Inbox::new(1024);
        let a = peer("a");
        inbox.open_slot(&a);
        inbox.close_slot(&a, true);
        inbox.open_slot(&a);
        inbox.push_message(&a, msg("fresh"));

        // The predecessor's flush and the new connection's message both
        // arrive; within a slot messages always come first.
        let (_, m, _) = expect_message(&inbox);
        assert_eq!(m, "fresh".as_bytes());
        assert!(matches!(
            inbox.poll_event(),
            Some((_, InboxEvent::OutputEmpty, _))
        ));
    }

    #[test]
    fn test_shut_down_unblocks_next_event() {
        let inbox = Inbox::new(1024);
        inbox.shut_down();
        assert!(inbox.next_event().is_none());
    }
}
