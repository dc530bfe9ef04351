//! Execution backends.
//!
//! A backend knows how to run two kinds of work over a [`Dataset`]:
//!
//! - **aggregate**: map every partition to a combinable partial aggregate and
//!   merge the partials into one value (used by `fit`, schema inference and
//!   drift snapshots);
//! - **map_partitions**: apply a task to each partition and return the
//!   transformed dataset (used by `transform`).
//!
//! [`EagerBackend`] runs everything on one materialized frame;
//! [`PartitionedBackend`] runs partitions in parallel on a rayon pool. For the
//! bundled stages both produce the same result up to floating-point
//! associativity.

pub mod accumulators;
pub mod eager;
pub mod partitioned;

pub use accumulators::{
    BucketPos, ColumnAccumulator, Combine, Frequencies, Histogram, InferenceStats, Moments, QuantileSketch,
    StageAccumulator,
};
pub use eager::EagerBackend;
pub use partitioned::PartitionedBackend;

use crate::dataset::Dataset;
use crate::error::Result;
use polars::prelude::DataFrame;

/// How a `map_partitions` task should be fed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapPlan {
    /// Name used in logs and error context.
    pub label: String,
    /// Rows of preceding data each partition needs, in ordering-key order.
    pub lookback: usize,
    /// Ordering key column. Required when `lookback > 0`.
    pub order_by: Option<String>,
}

impl MapPlan {
    /// Plan for tasks that look at one row (or one partition) at a time.
    pub fn independent(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            lookback: 0,
            order_by: None,
        }
    }

    /// Plan for window tasks that need `lookback` preceding rows.
    pub fn window(label: impl Into<String>, order_by: impl Into<String>, lookback: usize) -> Self {
        Self {
            label: label.into(),
            lookback,
            order_by: Some(order_by.into()),
        }
    }

    pub fn needs_context(&self) -> bool {
        self.lookback > 0 && self.order_by.is_some()
    }
}

/// A strategy for running partition work.
///
/// Methods are generic over the accumulator and the task so that closures are
/// statically dispatched; choose a backend at compile time or match on an
/// enum at the application boundary.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Map each partition to a partial aggregate, then combine the partials.
    ///
    /// Returns `A::default()` for a dataset with no partitions.
    fn aggregate<A, F>(&self, dataset: &Dataset, map: F) -> Result<A>
    where
        A: Combine,
        F: Fn(&DataFrame) -> Result<A> + Sync;

    /// Apply `task` to each partition. Window plans pass the preceding rows
    /// as the second argument; otherwise it is `None`.
    fn map_partitions<F>(&self, dataset: &Dataset, plan: &MapPlan, task: F) -> Result<Dataset>
    where
        F: Fn(&DataFrame, Option<&DataFrame>) -> Result<DataFrame> + Sync;
}

/// Fixed-shape pairwise reduction. The tree depends only on the number of
/// items, so the floating-point result is reproducible run to run.
pub(crate) fn tree_reduce<A: Combine>(mut items: Vec<A>) -> A {
    if items.len() <= 1 {
        return items.pop().unwrap_or_default();
    }
    let right = items.split_off(items.len() / 2);
    let (left, right) = rayon::join(|| tree_reduce(items), || tree_reduce(right));
    left.combine(right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_reduce_empty_is_identity() {
        let total: u64 = tree_reduce(Vec::new());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_tree_reduce_sums() {
        let total: u64 = tree_reduce((1..=100u64).collect());
        assert_eq!(total, 5050);
    }

    #[test]
    fn test_plan_needs_context() {
        assert!(!MapPlan::independent("trim_whitespace").needs_context());
        assert!(MapPlan::window("lag", "t", 2).needs_context());
        assert!(!MapPlan::window("lag", "t", 0).needs_context());
    }
}
