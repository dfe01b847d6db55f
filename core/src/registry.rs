//! State shared by every worker of a pool
//!
//! The registry is the only structure all workers and external submitters can
//! reach. It holds the stealing side of each worker deque, the per-worker
//! submission inboxes, the shutdown flags and the advisory statistics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::deque::Stealer;
use crate::error::{EngineError, EngineResult};
use crate::sleep::Sleep;
use crate::stats::{PoolStatistics, PoolStats};
use crate::worker::Job;

/// Submission channel feeding one worker
struct Inbox {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
}

pub(crate) struct Registry {
    config: PoolConfig,
    /// Head (thief) side of each worker's deque, indexed by worker
    stealers: Vec<Stealer<Job>>,
    /// External submissions, one inbox per worker
    inboxes: Vec<Inbox>,
    /// Round-robin cursor over inboxes
    next_inbox: AtomicUsize,
    /// Guards the accept/reject decision against a concurrent shutdown
    accepting: Mutex<bool>,
    /// Set once shutdown begins; workers drain their inbox and stop
    terminating: AtomicBool,
    sleep: Sleep,
    stats: CachePadded<PoolStatistics>,
}

impl Registry {
    pub(crate) fn new(config: PoolConfig, stealers: Vec<Stealer<Job>>) -> Self {
        let inboxes = (0..stealers.len())
            .map(|_| {
                let (sender, receiver) = crossbeam_channel::unbounded();
                Inbox { sender, receiver }
            })
            .collect();

        Self {
            config,
            stealers,
            inboxes,
            next_inbox: AtomicUsize::new(0),
            accepting: Mutex::new(true),
            terminating: AtomicBool::new(false),
            sleep: Sleep::new(),
            stats: CachePadded::new(PoolStatistics::new()),
        }
    }

    #[inline]
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn parallelism(&self) -> usize {
        self.stealers.len()
    }

    #[inline]
    pub(crate) fn stealer(&self, index: usize) -> &Stealer<Job> {
        &self.stealers[index]
    }

    #[inline]
    pub(crate) fn inbox(&self, index: usize) -> &Receiver<Job> {
        &self.inboxes[index].receiver
    }

    #[inline]
    pub(crate) fn sleep(&self) -> &Sleep {
        &self.sleep
    }

    #[inline]
    pub(crate) fn stats(&self) -> &PoolStatistics {
        &self.stats
    }

    /// Queue a root job on the next worker's inbox
    pub(crate) fn submit(&self, job: Job) -> EngineResult<()> {
        let accepting = self.accepting.lock();
        if !*accepting {
            return Err(EngineError::PoolShutdown);
        }

        let target = self.next_inbox.fetch_add(1, Ordering::Relaxed) % self.inboxes.len();
        self.inboxes[target]
            .sender
            .send(job)
            .map_err(|_| EngineError::PoolShutdown)?;
        drop(accepting);

        self.stats.record_submission();
        self.sleep.notify_one();
        Ok(())
    }

    /// Stop accepting submissions and tell workers to wind down
    ///
    /// Returns `true` for the call that actually initiated shutdown.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut accepting = self.accepting.lock();
        let initiated = *accepting;
        *accepting = false;
        self.terminating.store(true, Ordering::SeqCst);
        drop(accepting);

        self.sleep.notify_all();
        initiated
    }

    #[inline]
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Tasks waiting in deques and inboxes (may be stale)
    pub(crate) fn queued_tasks(&self) -> usize {
        let in_deques: usize = self.stealers.iter().map(Stealer::len).sum();
        let in_inboxes: usize = self.inboxes.iter().map(|inbox| inbox.receiver.len()).sum();
        in_deques + in_inboxes
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        self.stats
            .snapshot(self.parallelism(), self.queued_tasks(), self.sleep.sleeping())
    }
}
