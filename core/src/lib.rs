//! Work-stealing fork/join engine
//!
//! Callers describe a divide-and-conquer computation as a [`ForkJoinTask`]
//! and hand it to a [`ForkJoinPool`]. The pool runs the task tree across a
//! fixed set of worker threads. Each worker keeps its own deque of ready
//! subtasks, idle workers steal the oldest pending subtree from a peer, and a
//! worker waiting on a child keeps executing other ready work instead of
//! blocking.
//!
//! # Guarantees
//!
//! - **Deterministic results**: the merged output is identical to a
//!   single-threaded traversal ([`compute_sequential`]) regardless of how
//!   subtasks were scheduled
//! - **Exactly-once execution**: every subtask is delivered to exactly one
//!   worker; nothing is dropped or run twice
//! - **Deterministic failures**: when several leaves fail, the caller sees the
//!   failure of the lowest-index leaf
//! - **Progress with any pool size**: joining by helping means a single
//!   worker completes any task tree on its own
//!
//! ```no_run
//! use forkjoin_core::{BrightnessFilter, ForkJoinPool};
//! use std::time::Duration;
//!
//! let pool = ForkJoinPool::new(4)?;
//! let pixels: Vec<u32> = (0..5000).map(|i| i % 0xC8C8C8).collect();
//! let brightened = pool.invoke(BrightnessFilter::new(pixels))?;
//! assert_eq!(brightened.len(), 5000);
//! pool.shutdown(Duration::from_secs(5))?;
//! # Ok::<(), forkjoin_core::EngineError>(())
//! ```

pub mod config;
pub mod deque;
pub mod error;
pub mod join;
pub mod pool;
pub mod stats;
pub mod task;
pub mod tasks;

mod registry;
mod sleep;
mod worker;

pub use self::config::{default_parallelism, PoolConfig, DEFAULT_LEAF_THRESHOLD};
pub use self::deque::{Stealer, WorkerDeque};
pub use self::error::{EngineError, EngineResult, LeafError};
pub use self::join::JoinCell;
pub use self::pool::ForkJoinPool;
pub use self::stats::PoolStats;
pub use self::task::{compute_sequential, ForkJoinTask, TaskRange};
pub use self::tasks::{BrightnessFilter, SliceMapTask};
