//! Element-wise map over a shared slice
//!
//! The input is shared read-only by every subtask; each leaf produces the
//! output for its own disjoint range and merging concatenates in range order,
//! so no two tasks ever write the same output index.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult, LeafError};
use crate::task::{ForkJoinTask, TaskRange};

/// Applies a fallible per-element transform over `input[range]`
///
/// The transform receives the absolute index and the element. A failure at
/// index `k` is reported as a [`LeafError`] over `[k, k + 1)`.
pub struct SliceMapTask<I, O, F> {
    input: Arc<[I]>,
    transform: Arc<F>,
    range: TaskRange,
    _output: PhantomData<fn() -> O>,
}

impl<I, O, F> SliceMapTask<I, O, F>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    F: Fn(usize, &I) -> Result<O, String> + Send + Sync + 'static,
{
    /// Task covering the whole input
    pub fn new(input: impl Into<Arc<[I]>>, transform: F) -> Self {
        let input = input.into();
        let range = TaskRange::new(0, input.len());
        Self {
            input,
            transform: Arc::new(transform),
            range,
            _output: PhantomData,
        }
    }

    /// Restrict the task to `range`, which must lie within the input
    pub fn with_range(mut self, range: TaskRange) -> EngineResult<Self> {
        if range.end > self.input.len() {
            return Err(EngineError::InvalidConfig(format!(
                "range {} exceeds input length {}",
                range,
                self.input.len()
            )));
        }
        self.range = range;
        Ok(self)
    }

    fn child(&self, range: TaskRange) -> Self {
        Self {
            input: Arc::clone(&self.input),
            transform: Arc::clone(&self.transform),
            range,
            _output: PhantomData,
        }
    }
}

impl<I, O, F> ForkJoinTask for SliceMapTask<I, O, F>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    F: Fn(usize, &I) -> Result<O, String> + Send + Sync + 'static,
{
    type Output = Vec<O>;

    fn range(&self) -> TaskRange {
        self.range
    }

    fn split(self) -> (Self, Self) {
        let (left, right) = self.range.split();
        (self.child(left), self.child(right))
    }

    fn compute_leaf(self) -> Result<Self::Output, LeafError> {
        let transform = &*self.transform;
        self.input[self.range.indices()]
            .iter()
            .zip(self.range.indices())
            .map(|(element, index)| {
                transform(index, element).map_err(|message| LeafError::at(index, message))
            })
            .collect()
    }

    fn merge(mut left: Self::Output, right: Self::Output) -> Self::Output {
        left.extend(right);
        left
    }
}
