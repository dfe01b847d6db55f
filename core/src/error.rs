//! Error types for the fork/join engine
//!
//! Failures are values, never silently swallowed inside a worker loop. A
//! failing leaf short-circuits the merge chain along its ancestor path and the
//! caller of [`crate::ForkJoinPool::invoke`] observes exactly one error.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskRange;

/// Failure reported by a task's direct (leaf) computation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("leaf computation failed over {range}: {message}")]
pub struct LeafError {
    /// Index range the failure is attributed to
    pub range: TaskRange,
    /// Human-readable description of the failure
    pub message: String,
}

impl LeafError {
    /// Create a leaf error attributed to `range`
    pub fn new(range: TaskRange, message: impl Into<String>) -> Self {
        Self {
            range,
            message: message.into(),
        }
    }

    /// Create a leaf error attributed to the single index `index`
    pub fn at(index: usize, message: impl Into<String>) -> Self {
        Self::new(TaskRange::new(index, index + 1), message)
    }
}

/// Engine error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    LeafComputation(#[from] LeafError),

    #[error("pool is shutting down and no longer accepts tasks")]
    PoolShutdown,

    #[error("workers did not terminate within {0:?}; pool is still draining")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    TaskPanic(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl EngineError {
    /// Build a [`EngineError::TaskPanic`] from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        EngineError::TaskPanic(message)
    }
}

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;
