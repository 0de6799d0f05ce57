//! Cross-thread access to a running reactor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use mio::Waker;
use parking_lot::Mutex;
use tracing::{error, warn};

/// Cloneable handle to a reactor's service thread.
///
/// Enqueue-then-wake is unconditional: the loop re-checks its command
/// channel after every wait return, so a wake can never be lost to the
/// wait-before-signal race.
pub struct ReactorHandle<C> {
    inner: Arc<HandleInner<C>>,
}

struct HandleInner<C> {
    cmd_tx: Sender<C>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    service_thread: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C> Clone for ReactorHandle<C> {
    fn clone(&self) -> Self {
        ReactorHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> ReactorHandle<C> {
    pub(crate) fn new(
        cmd_tx: Sender<C>,
        waker: Arc<Waker>,
        running: Arc<AtomicBool>,
        thread: JoinHandle<()>,
    ) -> Self {
        ReactorHandle {
            inner: Arc::new(HandleInner {
                cmd_tx,
                waker,
                running,
                service_thread: thread.thread().id(),
                thread: Mutex::new(Some(thread)),
            }),
        }
    }

    /// Enqueue a command for the driver and wake the loop. Returns false
    /// once the loop is gone; the command is dropped in that case.
    pub fn send(&self, cmd: C) -> bool {
        if self.inner.cmd_tx.send(cmd).is_err() {
            return false;
        }
        self.wake();
        true
    }

    /// Force an immediate pass (and therefore an immediate housekeeping
    /// run). Lock-free and safe from any thread, including driver code.
    pub fn wake(&self) {
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "reactor wake failed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Idempotent shutdown. Raises the stop flag, wakes the loop, and joins
    /// the service thread - unless called from that thread itself, in which
    /// case the loop exits once the current dispatch returns.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::Relaxed) {
            self.wake();
        }
        if thread::current().id() == self.inner.service_thread {
            return;
        }
        if let Some(handle) = self.inner.thread.lock().take() {
            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

impl<C> Drop for HandleInner<C> {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::Relaxed) {
            let _ = self.waker.wake();
        }
        if thread::current().id() != self.service_thread {
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        }
    }
}
