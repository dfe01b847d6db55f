//! Fork/join worker pool
//!
//! The pool owns a fixed set of worker threads, the submission entry point and
//! the pool lifecycle. It is an explicit object: independent pools with
//! different parallelism can coexist in one process, and nothing is shared
//! implicitly between them.
//!
//! # Lifecycle
//!
//! - **Running**: `invoke` queues the root task on a worker inbox, chosen
//!   round-robin, and blocks until the root's result is recorded
//! - **Draining**: after `shutdown` begins, `invoke` fails with
//!   [`EngineError::PoolShutdown`]; workers finish in-flight work and any
//!   submissions accepted earlier, stop stealing and exit
//! - **Terminated**: every worker thread has been joined

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::deque::WorkerDeque;
use crate::error::{EngineError, EngineResult};
use crate::join::JoinCell;
use crate::registry::Registry;
use crate::stats::PoolStats;
use crate::task::ForkJoinTask;
use crate::worker::{self, Job, WorkerContext};

/// Work-stealing pool executing recursive [`ForkJoinTask`]s
pub struct ForkJoinPool {
    registry: Arc<Registry>,
    /// Worker threads not yet joined
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Disconnects once every worker thread has exited
    terminated: Receiver<()>,
}

impl ForkJoinPool {
    /// Start a pool with `parallelism` workers and default settings otherwise
    pub fn new(parallelism: usize) -> EngineResult<Self> {
        Self::with_config(PoolConfig::default().with_parallelism(parallelism))
    }

    /// Start a pool sized to the host's available parallelism
    pub fn with_default_parallelism() -> EngineResult<Self> {
        Self::with_config(PoolConfig::default())
    }

    /// Start a pool from an explicit configuration
    pub fn with_config(config: PoolConfig) -> EngineResult<Self> {
        config.validate()?;
        debug!("starting pool with {:?}", config);

        let parallelism = config.parallelism;
        let leaf_threshold = config.leaf_threshold;
        let deques: Vec<WorkerDeque<Job>> = (0..parallelism).map(|_| WorkerDeque::new()).collect();
        let stealers = deques.iter().map(WorkerDeque::stealer).collect();
        let registry = Arc::new(Registry::new(config, stealers));

        let (terminated_sender, terminated) = crossbeam_channel::bounded::<()>(0);
        let pool = ForkJoinPool {
            registry,
            handles: Mutex::new(Vec::with_capacity(parallelism)),
            terminated,
        };

        for (index, deque) in deques.into_iter().enumerate() {
            let handle = worker::spawn(
                index,
                deque,
                Arc::clone(&pool.registry),
                terminated_sender.clone(),
            )
            // Dropping `pool` on this path stops the workers already started.
            .map_err(|error| EngineError::Spawn(error.to_string()))?;
            pool.handles.lock().push(handle);
        }
        drop(terminated_sender);

        info!(
            "fork/join pool started: {} workers, leaf threshold {}",
            parallelism, leaf_threshold
        );
        Ok(pool)
    }

    /// Run `task` to completion and return its merged result
    ///
    /// Blocks the calling thread until the whole task tree has finished.
    /// Either the complete result or a single error is returned, never a
    /// partial result. When called from inside a task already running on this
    /// pool, the task executes inline on that worker.
    pub fn invoke<T: ForkJoinTask>(&self, task: T) -> EngineResult<T::Output> {
        if self.registry.is_terminating() {
            return Err(EngineError::PoolShutdown);
        }

        let task = match worker::try_execute_inline(&self.registry, task) {
            Ok(result) => return result,
            Err(task) => task,
        };

        let cell = Arc::new(JoinCell::new());
        let completion = Arc::clone(&cell);
        let job: Job = Box::new(move |worker: &WorkerContext| {
            completion.complete(worker.execute_guarded(task));
        });
        self.registry.submit(job)?;

        cell.wait();
        cell.take().unwrap_or(Err(EngineError::PoolShutdown))
    }

    /// Stop accepting work and wait up to `timeout` for every worker to exit
    ///
    /// In-flight computations run to completion. If the workers are still
    /// running when `timeout` elapses, [`EngineError::Timeout`] is returned
    /// and the pool stays draining; calling `shutdown` again resumes the wait.
    pub fn shutdown(&self, timeout: Duration) -> EngineResult<()> {
        if self.registry.begin_shutdown() {
            info!("fork/join pool shutting down");
        }

        if !self.wait_for_termination(timeout) {
            warn!(
                "pool shutdown timed out after {:?} with {} workers still running",
                timeout,
                self.registry.stats().live_workers()
            );
            return Err(EngineError::Timeout(timeout));
        }

        self.join_workers();
        info!("fork/join pool terminated");
        Ok(())
    }

    /// Whether shutdown has been initiated
    pub fn is_shutdown(&self) -> bool {
        self.registry.is_terminating()
    }

    /// Whether every worker thread has exited
    ///
    /// Each worker holds a termination sender from before it is spawned until
    /// its thread exits, so this never reports workers that have not started
    /// yet as terminated.
    pub fn is_terminated(&self) -> bool {
        self.registry.is_terminating()
            && matches!(self.terminated.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Configured number of workers
    pub fn parallelism(&self) -> usize {
        self.registry.parallelism()
    }

    /// Configured leaf threshold
    pub fn leaf_threshold(&self) -> usize {
        self.registry.config().leaf_threshold
    }

    /// Configuration this pool was started with
    pub fn config(&self) -> &PoolConfig {
        self.registry.config()
    }

    /// Workers currently executing work (advisory)
    pub fn active_worker_count(&self) -> usize {
        self.registry.stats().active_workers()
    }

    /// Tasks obtained by stealing so far (advisory)
    pub fn steal_count(&self) -> u64 {
        self.registry.stats().steal_count()
    }

    /// Tasks waiting in deques and inboxes (advisory)
    pub fn queued_task_count(&self) -> usize {
        self.registry.queued_tasks()
    }

    /// Snapshot of all advisory counters
    pub fn stats(&self) -> PoolStats {
        self.registry.snapshot()
    }

    fn wait_for_termination(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                // Workers never send; `recv` returns once all senders are gone.
                let _ = self.terminated.recv();
                return true;
            }
        };

        loop {
            match self.terminated.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    fn join_workers(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked before it could be joined");
            }
        }
    }
}

impl Drop for ForkJoinPool {
    fn drop(&mut self) {
        self.registry.begin_shutdown();

        if worker::is_worker_of(&self.registry) {
            warn!("pool dropped from one of its own workers; detaching worker threads");
            return;
        }
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;

    use crate::error::LeafError;
    use crate::task::{compute_sequential, TaskRange};
    use crate::tasks::{BrightnessFilter, SliceMapTask};

    const THRESHOLD: usize = 1000;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pool(parallelism: usize) -> ForkJoinPool {
        ForkJoinPool::with_config(
            PoolConfig::default()
                .with_parallelism(parallelism)
                .with_leaf_threshold(THRESHOLD),
        )
        .unwrap()
    }

    /// Maps `i -> 3i + 1`, failing at the configured indices
    #[derive(Clone)]
    struct AffineTask {
        range: TaskRange,
        failures: Arc<[usize]>,
    }

    impl AffineTask {
        fn new(len: usize) -> Self {
            Self::failing(len, &[])
        }

        fn failing(len: usize, failures: &[usize]) -> Self {
            Self {
                range: TaskRange::new(0, len),
                failures: failures.to_vec().into(),
            }
        }
    }

    impl ForkJoinTask for AffineTask {
        type Output = Vec<u64>;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (
                Self { range: left, failures: Arc::clone(&self.failures) },
                Self { range: right, failures: self.failures },
            )
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            let mut output = Vec::with_capacity(self.range.len());
            for index in self.range.indices() {
                if self.failures.contains(&index) {
                    return Err(LeafError::at(index, "injected failure"));
                }
                output.push(3 * index as u64 + 1);
            }
            Ok(output)
        }

        fn merge(mut left: Self::Output, right: Self::Output) -> Self::Output {
            left.extend(right);
            left
        }
    }

    /// Increments a per-index counter exactly as often as the index is computed
    struct CountingTask {
        range: TaskRange,
        hits: Arc<Vec<AtomicUsize>>,
    }

    impl ForkJoinTask for CountingTask {
        type Output = usize;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (
                Self { range: left, hits: Arc::clone(&self.hits) },
                Self { range: right, hits: self.hits },
            )
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            for index in self.range.indices() {
                self.hits[index].fetch_add(1, Ordering::Relaxed);
            }
            Ok(self.range.len())
        }

        fn merge(left: Self::Output, right: Self::Output) -> Self::Output {
            left + right
        }
    }

    /// Leaf that sleeps, to hold workers busy
    struct SlowTask {
        range: TaskRange,
        leaf_delay: Duration,
    }

    impl ForkJoinTask for SlowTask {
        type Output = usize;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (
                Self { range: left, leaf_delay: self.leaf_delay },
                Self { range: right, leaf_delay: self.leaf_delay },
            )
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            thread::sleep(self.leaf_delay);
            Ok(self.range.len())
        }

        fn merge(left: Self::Output, right: Self::Output) -> Self::Output {
            left + right
        }
    }

    /// Panics on the leaf covering index 0
    struct PanickingTask {
        range: TaskRange,
    }

    impl ForkJoinTask for PanickingTask {
        type Output = usize;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (Self { range: left }, Self { range: right })
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            if self.range.start == 0 {
                panic!("leaf exploded");
            }
            Ok(self.range.len())
        }

        fn merge(left: Self::Output, right: Self::Output) -> Self::Output {
            left + right
        }
    }

    /// Every leaf blocks until all leaves have reached the barrier
    struct RendezvousTask {
        range: TaskRange,
        barrier: Arc<Barrier>,
    }

    impl ForkJoinTask for RendezvousTask {
        type Output = usize;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (
                Self { range: left, barrier: Arc::clone(&self.barrier) },
                Self { range: right, barrier: self.barrier },
            )
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            self.barrier.wait();
            Ok(self.range.len())
        }

        fn merge(left: Self::Output, right: Self::Output) -> Self::Output {
            left + right
        }
    }

    /// Invokes the pool again from inside its own leaf computation
    struct NestedTask {
        range: TaskRange,
        pool: Arc<ForkJoinPool>,
    }

    impl ForkJoinTask for NestedTask {
        type Output = u64;

        fn range(&self) -> TaskRange {
            self.range
        }

        fn split(self) -> (Self, Self) {
            let (left, right) = self.range.split();
            (
                Self { range: left, pool: Arc::clone(&self.pool) },
                Self { range: right, pool: self.pool },
            )
        }

        fn compute_leaf(self) -> Result<Self::Output, LeafError> {
            let inner = AffineTask::new(2 * THRESHOLD + 1);
            let output = self
                .pool
                .invoke(inner)
                .map_err(|error| LeafError::new(self.range, error.to_string()))?;
            Ok(output.iter().sum())
        }

        fn merge(left: Self::Output, right: Self::Output) -> Self::Output {
            left + right
        }
    }

    /// Run `f` on a helper thread and fail if it does not finish in `limit`
    fn within<R: Send + 'static>(limit: Duration, f: impl FnOnce() -> R + Send + 'static) -> R {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let _ = sender.send(f());
        });
        receiver
            .recv_timeout(limit)
            .expect("operation did not complete in time")
    }

    #[test]
    fn test_matches_sequential_for_boundary_sizes() {
        init_logging();
        let sizes = [0, 1, THRESHOLD - 1, THRESHOLD, THRESHOLD + 1, 10 * THRESHOLD];

        for parallelism in [1, 2, 8] {
            let pool = pool(parallelism);
            for &len in &sizes {
                let expected = compute_sequential(AffineTask::new(len), THRESHOLD).unwrap();
                let actual = pool.invoke(AffineTask::new(len)).unwrap();
                assert_eq!(actual.len(), len);
                assert_eq!(actual, expected, "parallelism {} len {}", parallelism, len);
            }
            pool.shutdown(Duration::from_secs(10)).unwrap();
        }
    }

    #[test]
    fn test_every_index_computed_exactly_once() {
        init_logging();
        const LEN: usize = 64 * THRESHOLD + 17;

        for parallelism in [2, 4, 8] {
            let pool = ForkJoinPool::with_config(
                PoolConfig::default()
                    .with_parallelism(parallelism)
                    .with_leaf_threshold(50),
            )
            .unwrap();

            let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..LEN).map(|_| AtomicUsize::new(0)).collect());
            let total = pool
                .invoke(CountingTask { range: TaskRange::new(0, LEN), hits: Arc::clone(&hits) })
                .unwrap();

            assert_eq!(total, LEN);
            for (index, counter) in hits.iter().enumerate() {
                assert_eq!(counter.load(Ordering::Relaxed), 1, "index {} computed wrong number of times", index);
            }
        }
    }

    #[test]
    fn test_five_thousand_scenario() {
        init_logging();
        let pool = pool(4);
        let pixels: Vec<u32> = (0..5000u32).map(|i| i.wrapping_mul(2_654_435_761) % 0xC8C8C8).collect();

        let expected = compute_sequential(BrightnessFilter::new(pixels.clone()), THRESHOLD).unwrap();
        let output = pool.invoke(BrightnessFilter::new(pixels)).unwrap();

        assert_eq!(output.len(), 5000);
        assert_eq!(output, expected);

        let stats = pool.stats();
        assert_eq!(stats.leaves_computed, 8);
        assert_eq!(stats.tasks_forked, 7);
        assert_eq!(stats.tasks_submitted, 1);
    }

    #[test]
    fn test_leaf_failure_propagates_from_any_position() {
        init_logging();
        const LEN: usize = 10 * THRESHOLD;

        for parallelism in [1, 2, 8] {
            let pool = pool(parallelism);
            for k in [0, LEN / 2, LEN - 1] {
                let result = pool.invoke(AffineTask::failing(LEN, &[k]));
                match result {
                    Err(EngineError::LeafComputation(error)) => {
                        assert_eq!(error.range, TaskRange::new(k, k + 1));
                    }
                    other => panic!("expected leaf failure at {}, got {:?}", k, other.map(|v| v.len())),
                }
            }
        }
    }

    #[test]
    fn test_leftmost_failure_wins_deterministically() {
        init_logging();
        let pool = pool(8);
        let failures = [9_876, 3_210, 7_000];
        let expected = compute_sequential(AffineTask::failing(10_000, &failures), THRESHOLD).unwrap_err();
        assert_eq!(expected.range.start, 3_210);

        for _ in 0..20 {
            let error = pool.invoke(AffineTask::failing(10_000, &failures)).unwrap_err();
            assert_eq!(error, EngineError::LeafComputation(expected.clone()));
        }
    }

    #[test]
    fn test_terminates_across_pool_sizes() {
        init_logging();
        for parallelism in [1, 2, 3, 16, 64] {
            let output = within(Duration::from_secs(60), move || {
                let pool = pool(parallelism);
                let output = pool.invoke(AffineTask::new(20 * THRESHOLD + 3));
                pool.shutdown(Duration::from_secs(10)).map(|_| output)
            });
            let output = output.unwrap().unwrap();
            assert_eq!(output.len(), 20 * THRESHOLD + 3);
        }
    }

    #[test]
    fn test_concurrent_invokes_share_one_pool() {
        init_logging();
        let pool = Arc::new(pool(4));

        let callers: Vec<_> = (0..6)
            .map(|caller| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let len = 3 * THRESHOLD + caller * 101;
                    let output = pool.invoke(AffineTask::new(len)).unwrap();
                    (len, output)
                })
            })
            .collect();

        for caller in callers {
            let (len, output) = caller.join().unwrap();
            assert_eq!(output, compute_sequential(AffineTask::new(len), THRESHOLD).unwrap());
        }
        assert_eq!(pool.stats().tasks_submitted, 6);
    }

    #[test]
    fn test_invoke_after_shutdown_is_rejected() {
        init_logging();
        let pool = pool(2);
        pool.shutdown(Duration::from_secs(10)).unwrap();

        assert!(pool.is_shutdown());
        assert!(pool.is_terminated());
        assert_eq!(pool.invoke(AffineTask::new(10)), Err(EngineError::PoolShutdown));
        // A second shutdown is a no-op.
        assert!(pool.shutdown(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_shutdown_timeout_is_reported_and_retryable() {
        init_logging();
        let pool = Arc::new(pool(2));

        let caller = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.invoke(SlowTask {
                    range: TaskRange::new(0, 10),
                    leaf_delay: Duration::from_millis(400),
                })
            })
        };

        while pool.active_worker_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            pool.shutdown(Duration::from_millis(5)),
            Err(EngineError::Timeout(Duration::from_millis(5)))
        );
        assert!(pool.is_shutdown());

        // In-flight work still completes and the wait can be retried.
        assert_eq!(caller.join().unwrap(), Ok(10));
        assert!(pool.shutdown(Duration::from_secs(10)).is_ok());
        assert_eq!(pool.stats().live_workers, 0);
    }

    #[test]
    fn test_is_terminated_only_after_workers_exit() {
        init_logging();
        for _ in 0..50 {
            let pool = pool(8);
            assert!(!pool.is_terminated());

            // Workers may not even have started when the zero wait expires.
            let _ = pool.shutdown(Duration::ZERO);
            if pool.is_terminated() {
                assert_eq!(pool.shutdown(Duration::ZERO), Ok(()));
                assert_eq!(pool.stats().live_workers, 0);
            }
            pool.shutdown(Duration::from_secs(10)).unwrap();
            assert!(pool.is_terminated());
        }
    }

    #[test]
    fn test_forked_child_is_stolen_by_idle_worker() {
        init_logging();
        let pool = Arc::new(
            ForkJoinPool::with_config(
                PoolConfig::default()
                    .with_parallelism(2)
                    .with_leaf_threshold(1),
            )
            .unwrap(),
        );

        // The root splits into two leaves that must run at the same time. The
        // forked left leaf sits on the submitting worker's deque while that
        // worker blocks in the right leaf, so only a steal can finish it.
        let task = RendezvousTask { range: TaskRange::new(0, 2), barrier: Arc::new(Barrier::new(2)) };
        let invoker = Arc::clone(&pool);
        let total = within(Duration::from_secs(30), move || invoker.invoke(task));

        assert_eq!(total, Ok(2));
        assert!(pool.steal_count() >= 1);
        assert!(pool.stats().steal_attempts >= pool.steal_count());
    }

    #[test]
    fn test_leaf_panic_becomes_error_and_pool_survives() {
        init_logging();
        let pool = pool(2);

        let result = pool.invoke(PanickingTask { range: TaskRange::new(0, 5 * THRESHOLD) });
        assert_eq!(result, Err(EngineError::TaskPanic("leaf exploded".to_string())));

        let output = pool.invoke(AffineTask::new(4 * THRESHOLD)).unwrap();
        assert_eq!(output.len(), 4 * THRESHOLD);
    }

    #[test]
    fn test_nested_invoke_runs_inline_on_single_worker() {
        init_logging();
        let pool = Arc::new(pool(1));
        let per_leaf: u64 = (0..(2 * THRESHOLD + 1) as u64).map(|i| 3 * i + 1).sum();

        let task = NestedTask { range: TaskRange::new(0, 4 * THRESHOLD), pool: Arc::clone(&pool) };
        let total = within(Duration::from_secs(30), move || task.pool.clone().invoke(task));

        // 4 * THRESHOLD splits into 4 leaves, each running a nested invoke.
        assert_eq!(total, Ok(4 * per_leaf));
    }

    #[test]
    fn test_slice_map_task_on_pool() {
        init_logging();
        let pool = pool(4);
        let words: Vec<String> = (0..2500).map(|i| format!("w{}", i)).collect();
        let task = SliceMapTask::new(words.clone(), |_, word: &String| Ok(word.len()));

        let output = pool.invoke(task).unwrap();
        assert_eq!(output, words.iter().map(String::len).collect::<Vec<_>>());
    }

    #[test]
    fn test_observability_readouts() {
        init_logging();
        let pool = pool(3);
        assert_eq!(pool.parallelism(), 3);
        assert_eq!(pool.leaf_threshold(), THRESHOLD);

        pool.invoke(AffineTask::new(16 * THRESHOLD)).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.parallelism, 3);
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.leaves_computed, 16);
        assert_eq!(stats.tasks_forked, 15);
        assert!(stats.steal_count <= stats.steal_attempts);
        assert_eq!(pool.steal_count(), stats.steal_count);
        assert_eq!(pool.queued_task_count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(ForkJoinPool::new(0), Err(EngineError::InvalidConfig(_))));
        assert!(matches!(
            ForkJoinPool::with_config(PoolConfig::default().with_leaf_threshold(0)),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_drop_without_shutdown_joins_workers() {
        init_logging();
        let pool = pool(4);
        assert_eq!(pool.invoke(AffineTask::new(10)).unwrap().len(), 10);
        drop(pool);
    }
}
