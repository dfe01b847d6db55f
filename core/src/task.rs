//! Recursive task abstraction
//!
//! A task covers a half-open index range over some shared, read-only input.
//! Small ranges are computed directly; larger ones split at the midpoint into
//! two contiguous, disjoint children whose union is the parent range.
//!
//! # Properties
//!
//! - **Balanced depth**: midpoint splitting bounds the tree depth at
//!   O(log(N / threshold)) independent of input values
//! - **Termination**: every split strictly shrinks `end - start`, so any
//!   root-to-leaf path is finite
//! - **Order preservation**: `merge(left, right)` reproduces what a single
//!   left-to-right traversal of the parent range would produce

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::LeafError;

/// Half-open index range `[start, end)` covered by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRange {
    /// First index covered (inclusive)
    pub start: usize,
    /// One past the last index covered (exclusive)
    pub end: usize,
}

impl TaskRange {
    /// Create a new range; `start` must not exceed `end`
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "range start {} exceeds end {}", start, end);
        Self { start, end }
    }

    /// Number of indices covered
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the range covers no indices
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether a task over this range computes directly
    #[inline]
    pub fn is_leaf(&self, threshold: usize) -> bool {
        self.len() <= threshold
    }

    /// Midpoint used for binary splitting
    #[inline]
    pub fn midpoint(&self) -> usize {
        self.start + self.len() / 2
    }

    /// Split into `[start, mid)` and `[mid, end)`
    pub fn split(self) -> (TaskRange, TaskRange) {
        let mid = self.midpoint();
        (TaskRange::new(self.start, mid), TaskRange::new(mid, self.end))
    }

    /// Indices covered, as a std range
    #[inline]
    pub fn indices(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for TaskRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<Range<usize>> for TaskRange {
    fn from(range: Range<usize>) -> Self {
        TaskRange::new(range.start, range.end)
    }
}

/// Unit of recursive, splittable work
///
/// Implementors describe *what* a piece of work is; the pool decides *where*
/// and *when* it runs. Shared input is expected to live behind an `Arc` so
/// that splitting is cheap and children can migrate between workers.
pub trait ForkJoinTask: Send + Sized + 'static {
    /// Result produced by a subtree
    type Output: Send + 'static;

    /// Index range covered by this task
    fn range(&self) -> TaskRange;

    /// Split into exactly two children covering `[start, mid)` and `[mid, end)`
    fn split(self) -> (Self, Self);

    /// Compute the result of a leaf range directly
    fn compute_leaf(self) -> Result<Self::Output, LeafError>;

    /// Combine the results of two adjacent children, left before right
    fn merge(left: Self::Output, right: Self::Output) -> Self::Output;

    /// Whether this task computes directly rather than splitting
    fn is_leaf(&self, threshold: usize) -> bool {
        self.range().is_leaf(threshold)
    }
}

/// Single-threaded depth-first traversal of a task tree
///
/// Follows the same split and merge contract as the pool and reports the
/// leftmost failing leaf, which makes it the reference result for any
/// parallel run over the same task.
pub fn compute_sequential<T: ForkJoinTask>(task: T, threshold: usize) -> Result<T::Output, LeafError> {
    if task.is_leaf(threshold) {
        return task.compute_leaf();
    }

    let (left, right) = task.split();
    let left = compute_sequential(left, threshold)?;
    let right = compute_sequential(right, threshold)?;
    Ok(T::merge(left, right))
}
