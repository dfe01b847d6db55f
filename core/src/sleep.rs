//! Idle parking for workers that found no work anywhere

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shared park/notify point for idle workers
///
/// Parking is always bounded by a timeout, so a notification lost to a race
/// only delays a rescan instead of stalling a worker.
pub(crate) struct Sleep {
    lock: Mutex<()>,
    wake: Condvar,
    sleepers: AtomicUsize,
}

impl Sleep {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            wake: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }

    /// Park the calling worker for at most `timeout`
    pub(crate) fn park(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let _ = self.wake.wait_for(&mut guard, timeout);
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake one parked worker, if any is parked
    pub(crate) fn notify_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.wake.notify_one();
        }
    }

    /// Wake every parked worker
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }

    /// Number of workers currently parked
    pub(crate) fn sleeping(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }
}
