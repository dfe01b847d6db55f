//! Worker threads: the fork/join execution loop
//!
//! Each worker owns one deque. It pops its own tail first (depth-first, LIFO),
//! then its submission inbox, and only then steals from the head of a peer's
//! deque, starting at a pseudo-random victim. When nothing is found anywhere
//! it spins briefly with [`Backoff`] and then parks for a bounded interval.
//!
//! # Joining by helping
//!
//! A worker waiting on a forked child never simply blocks. While the child's
//! [`JoinCell`] is pending it keeps executing ready work: first its own tail,
//! which is the child itself unless it was stolen, then anything it can steal.
//! Only when the whole pool is dry does it wait on the cell, and then only for
//! the idle-park interval before scanning again. The task graph is a tree with
//! strictly shrinking ranges, so the wait-for graph has no cycles and a pool
//! with a single worker makes progress on its own.

use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use crossbeam_utils::Backoff;
use log::{debug, error, trace};

use crate::deque::WorkerDeque;
use crate::error::{EngineError, EngineResult};
use crate::join::JoinCell;
use crate::registry::Registry;
use crate::task::ForkJoinTask;

/// Type-erased unit of work queued on deques and inboxes
pub(crate) type Job = Box<dyn FnOnce(&WorkerContext) + Send>;

thread_local! {
    /// Context of the worker running on this thread, null elsewhere
    static CURRENT_WORKER: Cell<*const WorkerContext> = const { Cell::new(ptr::null()) };
}

/// Clears `CURRENT_WORKER` when the worker loop exits, even by unwinding
struct CurrentWorkerGuard;

impl Drop for CurrentWorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(ptr::null()));
    }
}

/// Per-thread worker state, reachable only from its own thread
pub(crate) struct WorkerContext {
    index: usize,
    deque: WorkerDeque<Job>,
    registry: Arc<Registry>,
    /// xorshift state for victim selection
    rng: Cell<u64>,
}

/// Start worker `index` on a new named thread
///
/// `terminated` is held for the lifetime of the thread; its disconnection is
/// how the pool learns that every worker has exited.
pub(crate) fn spawn(
    index: usize,
    deque: WorkerDeque<Job>,
    registry: Arc<Registry>,
    terminated: Sender<()>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("{}-{}", registry.config().thread_name_prefix, index);

    thread::Builder::new().name(name).spawn(move || {
        let context = WorkerContext::new(index, deque, registry);
        context.run();
        drop(terminated);
    })
}

/// Run `task` on the current thread if it is a worker of `registry`
///
/// Hands the task back when called from any other thread.
pub(crate) fn try_execute_inline<T: ForkJoinTask>(
    registry: &Arc<Registry>,
    task: T,
) -> Result<EngineResult<T::Output>, T> {
    CURRENT_WORKER.with(|current| {
        let worker = current.get();
        if worker.is_null() {
            return Err(task);
        }
        // SAFETY: the pointer is set by `WorkerContext::run` for the duration
        // of the loop on this very thread and cleared before the context drops.
        let worker = unsafe { &*worker };
        if !Arc::ptr_eq(&worker.registry, registry) {
            return Err(task);
        }
        Ok(worker.execute_guarded(task))
    })
}

/// Whether the current thread is a worker of `registry`
pub(crate) fn is_worker_of(registry: &Arc<Registry>) -> bool {
    CURRENT_WORKER.with(|current| {
        let worker = current.get();
        // SAFETY: see `try_execute_inline`.
        !worker.is_null() && Arc::ptr_eq(unsafe { &(*worker).registry }, registry)
    })
}

impl WorkerContext {
    fn new(index: usize, deque: WorkerDeque<Job>, registry: Arc<Registry>) -> Self {
        Self {
            index,
            deque,
            registry,
            rng: Cell::new((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        }
    }

    /// Main worker loop
    fn run(&self) {
        CURRENT_WORKER.with(|current| current.set(self as *const WorkerContext));
        let _guard = CurrentWorkerGuard;

        let stats = self.registry.stats();
        let idle_park = self.registry.config().idle_park();
        stats.worker_started();
        debug!("worker {} started", self.index);

        let backoff = Backoff::new();
        loop {
            if let Some(job) = self.find_local_work() {
                self.run_top_level(job);
                backoff.reset();
                continue;
            }

            if self.registry.is_terminating() {
                // Submissions accepted before shutdown may have landed after the
                // scan above; drain them, but take nothing new from peers.
                match self.find_local_work() {
                    Some(job) => {
                        self.run_top_level(job);
                        continue;
                    }
                    None => break,
                }
            }

            if let Some(job) = self.steal_work() {
                self.run_top_level(job);
                backoff.reset();
                continue;
            }

            if backoff.is_completed() {
                self.registry.sleep().park(idle_park);
            } else {
                backoff.snooze();
            }
        }

        stats.worker_stopped();
        debug!("worker {} terminated", self.index);
    }

    fn run_top_level(&self, job: Job) {
        let stats = self.registry.stats();
        stats.job_started();
        job(self);
        stats.job_finished();
    }

    /// Own tail first, then own inbox
    fn find_local_work(&self) -> Option<Job> {
        self.deque
            .pop_tail()
            .or_else(|| self.registry.inbox(self.index).try_recv().ok())
    }

    /// Steal from a peer deque head, falling back to peer inboxes
    fn steal_work(&self) -> Option<Job> {
        let count = self.registry.parallelism();
        if count <= 1 {
            return None;
        }

        let start = self.next_victim(count);
        for offset in 0..count {
            let victim = (start + offset) % count;
            if victim == self.index {
                continue;
            }
            let stealer = self.registry.stealer(victim);
            if stealer.is_empty() {
                continue;
            }

            let job = stealer.steal_head();
            self.registry.stats().record_steal_attempt(job.is_some());
            if job.is_some() {
                trace!("worker {} stole from worker {}", self.index, victim);
                return job;
            }
        }

        for offset in 0..count {
            let victim = (start + offset) % count;
            if victim == self.index {
                continue;
            }
            if let Ok(job) = self.registry.inbox(victim).try_recv() {
                trace!("worker {} took a submission queued for worker {}", self.index, victim);
                return Some(job);
            }
        }

        None
    }

    fn next_victim(&self, count: usize) -> usize {
        let mut state = self.rng.get();
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng.set(state);
        (state % count as u64) as usize
    }

    /// Execute a task tree rooted at `task`, forking and joining as needed
    pub(crate) fn execute<T: ForkJoinTask>(&self, task: T) -> EngineResult<T::Output> {
        if task.is_leaf(self.registry.config().leaf_threshold) {
            return self.compute_leaf(task);
        }

        let range = task.range();
        let (left, right) = task.split();
        trace!(
            "worker {} split {} into {} and {}",
            self.index,
            range,
            left.range(),
            right.range()
        );

        let forked = self.fork(left);
        let right = self.execute(right);
        let left = self.join(&forked);

        // The left (lower-index) failure wins, independent of timing.
        match (left, right) {
            (Err(error), _) | (Ok(_), Err(error)) => Err(error),
            (Ok(left), Ok(right)) => Ok(T::merge(left, right)),
        }
    }

    /// Like [`WorkerContext::execute`], converting an escaped panic into an error
    pub(crate) fn execute_guarded<T: ForkJoinTask>(&self, task: T) -> EngineResult<T::Output> {
        panic::catch_unwind(AssertUnwindSafe(|| self.execute(task))).unwrap_or_else(|payload| {
            let error = EngineError::from_panic(payload);
            error!("worker {} caught a task panic: {}", self.index, error);
            Err(error)
        })
    }

    fn compute_leaf<T: ForkJoinTask>(&self, task: T) -> EngineResult<T::Output> {
        let range = task.range();
        trace!("worker {} computing leaf {}", self.index, range);
        self.registry.stats().record_leaf();

        match panic::catch_unwind(AssertUnwindSafe(|| task.compute_leaf())) {
            Ok(result) => result.map_err(EngineError::from),
            Err(payload) => {
                let error = EngineError::from_panic(payload);
                error!("leaf {} panicked on worker {}: {}", range, self.index, error);
                Err(error)
            }
        }
    }

    /// Push `task` onto this worker's tail for possibly-parallel execution
    fn fork<T: ForkJoinTask>(&self, task: T) -> Arc<JoinCell<EngineResult<T::Output>>> {
        let cell = Arc::new(JoinCell::new());
        let completion = Arc::clone(&cell);
        let job: Job = Box::new(move |worker: &WorkerContext| {
            completion.complete(worker.execute_guarded(task));
        });

        self.deque.push_tail(job);
        self.registry.stats().record_fork();
        self.registry.sleep().notify_one();
        cell
    }

    /// Wait for `cell`, executing other ready work in the meantime
    fn join<R>(&self, cell: &JoinCell<R>) -> R {
        let idle_park = self.registry.config().idle_park();
        let backoff = Backoff::new();

        loop {
            if let Some(value) = cell.take() {
                return value;
            }

            if let Some(job) = self.find_local_work().or_else(|| self.steal_work()) {
                job(self);
                backoff.reset();
                continue;
            }

            if backoff.is_completed() {
                cell.wait_timeout(idle_park);
            } else {
                backoff.snooze();
            }
        }
    }
}
