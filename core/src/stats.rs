//! Advisory pool statistics
//!
//! Counters are updated with relaxed ordering and may be momentarily
//! inconsistent with each other. They exist for diagnostics only; nothing in
//! the scheduler reads them to make decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Cache-aligned scheduler counters
#[repr(align(64))]
pub(crate) struct PoolStatistics {
    /// Root tasks accepted through `invoke`
    tasks_submitted: AtomicU64,
    /// Children handed to a worker deque
    tasks_forked: AtomicU64,
    /// Leaf computations performed
    leaves_computed: AtomicU64,
    /// Steal attempts against a peer deque
    steals_attempted: AtomicU64,
    /// Steal attempts that returned a task
    steals_successful: AtomicU64,
    /// Worker threads that have started and not yet terminated
    live_workers: AtomicUsize,
    /// Workers currently executing a top-level job
    active_workers: AtomicUsize,
}

impl PoolStatistics {
    pub(crate) fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_forked: AtomicU64::new(0),
            leaves_computed: AtomicU64::new(0),
            steals_attempted: AtomicU64::new(0),
            steals_successful: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_submission(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fork(&self) {
        self.tasks_forked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_leaf(&self) {
        self.leaves_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal_attempt(&self, successful: bool) {
        self.steals_attempted.fetch_add(1, Ordering::Relaxed);
        if successful {
            self.steals_successful.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn worker_started(&self) {
        self.live_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_stopped(&self) {
        self.live_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn job_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn steal_count(&self) -> u64 {
        self.steals_successful.load(Ordering::Relaxed)
    }

    /// Snapshot every counter, pairing them with pool-level readings
    pub(crate) fn snapshot(&self, parallelism: usize, queued_tasks: usize, parked_workers: usize) -> PoolStats {
        PoolStats {
            parallelism,
            live_workers: self.live_workers(),
            active_workers: self.active_workers(),
            parked_workers,
            steal_attempts: self.steals_attempted.load(Ordering::Relaxed),
            steal_count: self.steal_count(),
            queued_tasks,
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_forked: self.tasks_forked.load(Ordering::Relaxed),
            leaves_computed: self.leaves_computed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a pool's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured worker count
    pub parallelism: usize,
    /// Workers started and not yet terminated
    pub live_workers: usize,
    /// Workers currently executing work
    pub active_workers: usize,
    /// Workers parked for lack of work
    pub parked_workers: usize,
    /// Steal attempts against peer deques
    pub steal_attempts: u64,
    /// Tasks obtained by stealing
    pub steal_count: u64,
    /// Tasks waiting in deques and submission inboxes
    pub queued_tasks: usize,
    /// Root tasks accepted
    pub tasks_submitted: u64,
    /// Child tasks forked
    pub tasks_forked: u64,
    /// Leaf computations performed
    pub leaves_computed: u64,
}

impl PoolStats {
    /// Fraction of steal attempts that obtained a task
    pub fn steal_success_rate(&self) -> f64 {
        if self.steal_attempts > 0 {
            self.steal_count as f64 / self.steal_attempts as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active threads: {}, steal count: {}, queued tasks: {}",
            self.active_workers, self.steal_count, self.queued_tasks
        )
    }
}
