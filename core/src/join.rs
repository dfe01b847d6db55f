//! Set-once completion cell for forked tasks
//!
//! A [`JoinCell`] is created for every forked child and for every externally
//! submitted root. The producer completes it exactly once; observers check the
//! flag with acquire ordering, so nobody can see a result before the flag is
//! set. Workers joining a cell poll it between helping steps and only fall back
//! to a timed wait when the pool has no work for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Completion flag, result slot and waiter signal for a single task
pub struct JoinCell<T> {
    /// Set once, with release ordering, after the slot is filled
    complete: AtomicBool,
    /// Result, present from completion until taken
    slot: Mutex<Option<T>>,
    /// Wakes blocked waiters on completion
    waiters: Condvar,
}

impl<T> JoinCell<T> {
    /// Create a pending cell
    pub fn new() -> Self {
        Self {
            complete: AtomicBool::new(false),
            slot: Mutex::new(None),
            waiters: Condvar::new(),
        }
    }

    /// Record the result and wake all waiters
    ///
    /// Returns `false`, leaving the first value in place, if the cell was
    /// already completed.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if self.complete.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(value);
        self.complete.store(true, Ordering::Release);
        drop(slot);

        self.waiters.notify_all();
        true
    }

    /// Whether the result has been recorded
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Take the result if the cell is complete and nobody took it yet
    pub fn take(&self) -> Option<T> {
        if !self.is_complete() {
            return None;
        }
        self.slot.lock().take()
    }

    /// Block until complete or until `timeout` elapses; returns completion
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut slot = self.slot.lock();
        if !self.is_complete() {
            let _ = self.waiters.wait_for(&mut slot, timeout);
        }
        self.is_complete()
    }

    /// Block until complete
    pub fn wait(&self) {
        let mut slot = self.slot.lock();
        while !self.is_complete() {
            self.waiters.wait(&mut slot);
        }
    }
}

impl<T> Default for JoinCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
