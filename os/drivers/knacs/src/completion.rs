use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A counting completion, the worker's only suspension point.
///
/// [`complete`](Self::complete) never blocks beyond the short internal lock,
/// so completion callbacks may call it. Signals are never lost: a `complete`
/// that lands before the matching [`wait`](Self::wait) makes that wait return
/// immediately.
#[derive(Debug, Default)]
pub struct Completion {
    pending: Mutex<u32>,
    cond: Condvar,
    signals: AtomicU64,
}

impl Completion {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
            signals: AtomicU64::new(0),
        }
    }

    pub fn complete(&self) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        let mut pending = self.pending.lock();
        *pending = pending.saturating_add(1);
        self.cond.notify_one();
    }

    /// Block until signalled, then consume every pending signal.
    ///
    /// Returns how many signals were consumed.
    pub fn wait(&self) -> u32 {
        let mut pending = self.pending.lock();
        while *pending == 0 {
            self.cond.wait(&mut pending);
        }
        core::mem::take(&mut *pending)
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns 0 when the timeout passed without a signal.
    pub fn wait_timeout(&self, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while *pending == 0 {
            if self.cond.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        core::mem::take(&mut *pending)
    }

    /// Signals raised since creation.
    #[must_use]
    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Acquire)
    }
}
