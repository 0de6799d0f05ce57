//! Reactor construction and the service loop

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, warn};

use weir_core::WeirResult;

use crate::ReactorHandle;

/// Token reserved for the loop's waker. Drivers must not register it.
pub const WAKER_TOKEN: Token = Token(1);

/// Readiness events accepted per wait return.
const MAX_EVENTS: usize = 128;

/// A reactor driver. It exclusively owns the registration table and all
/// per-channel state; every method runs on the reactor thread, which is
/// what makes "configure interest" and "receive notification" atomic with
/// respect to each other.
pub trait Drive: Send + 'static {
    /// Commands foreign threads enqueue through [`ReactorHandle::send`].
    type Command: Send + 'static;

    /// One readiness event for a token the driver registered.
    fn on_ready(&mut self, token: Token, readable: bool, writable: bool);

    /// One command drained from the channel. The loop drains all pending
    /// commands after every wait return, before readiness dispatch, so a
    /// configuration change is visible to the events that follow it.
    fn on_command(&mut self, cmd: Self::Command);

    /// Housekeeping. Runs once per pass: at least every tick interval, and
    /// immediately after any wake. Errors are the driver's to swallow.
    fn on_tick(&mut self);

    /// Cleanup on loop exit, still on the reactor thread.
    fn on_stop(&mut self);
}

/// One readiness-multiplexing loop, not yet bound to its thread.
pub struct Reactor {
    poll: Poll,
    waker: Arc<Waker>,
    tick_interval: Duration,
}

impl Reactor {
    /// Open the multiplexer and its waker. This is the only reactor
    /// operation whose failure surfaces synchronously to the caller.
    pub fn new(tick_interval: Duration) -> WeirResult<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Reactor {
            poll,
            waker,
            tick_interval,
        })
    }

    /// An independent registry handle, for registrations that must happen
    /// before the loop starts (a listener, typically).
    pub fn registry(&self) -> WeirResult<Registry> {
        Ok(self.poll.registry().try_clone()?)
    }

    /// Launch the service thread. Consuming `self` makes double-start
    /// unrepresentable; stopping goes through the returned handle.
    pub fn spawn<D: Drive>(
        self,
        thread_name: &str,
        driver: D,
    ) -> WeirResult<ReactorHandle<D::Command>> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let service = Service {
            poll: self.poll,
            tick_interval: self.tick_interval,
            cmd_rx,
            running: Arc::clone(&running),
            driver,
        };
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || service.run())?;

        Ok(ReactorHandle::new(cmd_tx, self.waker, running, thread))
    }
}

/// Loop state owned by the service thread.
struct Service<D: Drive> {
    poll: Poll,
    tick_interval: Duration,
    cmd_rx: Receiver<D::Command>,
    running: Arc<AtomicBool>,
    driver: D,
}

impl<D: Drive> Service<D> {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        debug!(tick = ?self.tick_interval, "reactor loop running");

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.tick_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "poll failed");
                continue;
            }

            // Commands first: a wake never implies readiness, and a pending
            // configuration change must land before the events behind it.
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.driver.on_command(cmd);
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                self.driver
                    .on_ready(token, event.is_readable(), event.is_writable());
            }

            self.driver.on_tick();
        }

        self.driver.on_stop();
        debug!("reactor loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct Counters {
        commands: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
        cleaned_up: Arc<AtomicBool>,
    }

    struct CountingDriver(Counters);

    impl Drive for CountingDriver {
        type Command = u32;

        fn on_ready(&mut self, _token: Token, _readable: bool, _writable: bool) {}

        fn on_command(&mut self, _cmd: u32) {
            self.0.commands.fetch_add(1, Ordering::SeqCst);
        }

        fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stop(&mut self) {
            self.0.cleaned_up.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn spawn_counting(tick: Duration) -> (ReactorHandle<u32>, Counters) {
        let counters = Counters::default();
        let reactor = Reactor::new(tick).unwrap();
        let handle = reactor
            .spawn("weir-reactor-test", CountingDriver(counters.clone()))
            .unwrap();
        (handle, counters)
    }

    #[test]
    fn test_commands_wake_the_loop() {
        // Long tick: only the wake can explain prompt execution.
        let (handle, counters) = spawn_counting(Duration::from_secs(5));

        assert!(handle.send(1));
        assert!(handle.send(2));
        assert!(handle.send(3));
        wait_until("3 commands", || {
            counters.commands.load(Ordering::SeqCst) == 3
        });

        handle.stop();
    }

    #[test]
    fn test_tick_runs_on_interval_without_traffic() {
        let (handle, counters) = spawn_counting(Duration::from_millis(5));

        wait_until("ticks", || counters.ticks.load(Ordering::SeqCst) >= 3);

        handle.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_runs_cleanup() {
        let (handle, counters) = spawn_counting(Duration::from_millis(5));

        handle.stop();
        assert!(counters.cleaned_up.load(Ordering::SeqCst));
        assert!(!handle.is_running());

        // Second stop is a quiet no-op.
        handle.stop();
    }

    #[test]
    fn test_send_after_stop_reports_failure() {
        let (handle, counters) = spawn_counting(Duration::from_millis(5));

        handle.stop();
        assert!(!handle.send(9));
        assert_eq!(counters.commands.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wake_forces_immediate_tick() {
        let (handle, counters) = spawn_counting(Duration::from_secs(5));

        // Let the spawn-time pass settle, then wake explicitly.
        let before = counters.ticks.load(Ordering::SeqCst);
        handle.wake();
        wait_until("tick after wake", || {
            counters.ticks.load(Ordering::SeqCst) > before
        });

        handle.stop();
    }
}
