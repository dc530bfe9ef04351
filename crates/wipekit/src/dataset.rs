//! Tabular inputs: fully materialized frames or ordered partitions.
//!
//! A [`Dataset`] never owns file handles or connections. Partitioned data is
//! read through a [`PartitionSource`], which loads one partition at a time on
//! demand; callers plug their own storage in by implementing it.

use crate::error::{ErrorContext, Result, WipekitError};
use polars::prelude::*;
use std::fmt::Debug;
use std::sync::Arc;

/// Ordered collection of independently loadable partitions.
///
/// Implementations must be deterministic: loading the same index twice yields
/// the same frame. Loads may run concurrently from several worker threads.
pub trait PartitionSource: Send + Sync + Debug {
    fn partition_count(&self) -> usize;

    fn load(&self, index: usize) -> Result<DataFrame>;

    /// Total rows, when the source knows it without loading data.
    fn row_count_hint(&self) -> Option<usize> {
        None
    }
}

/// Partitions already held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryPartitions {
    partitions: Vec<DataFrame>,
}

impl InMemoryPartitions {
    pub fn new(partitions: Vec<DataFrame>) -> Self {
        Self { partitions }
    }

    /// Split a frame into `count` contiguous, near-equal partitions.
    ///
    /// Produces exactly `count` partitions; trailing ones may be empty when
    /// there are fewer rows than partitions.
    pub fn split(df: &DataFrame, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(WipekitError::configuration(
                ErrorContext::new(),
                "partition count must be at least 1",
            ));
        }
        let height = df.height();
        let base = height / count;
        let extra = height % count;
        let mut offset = 0usize;
        let mut partitions = Vec::with_capacity(count);
        for i in 0..count {
            let len = base + usize::from(i < extra);
            partitions.push(df.slice(offset as i64, len));
            offset += len;
        }
        Ok(Self { partitions })
    }
}

impl PartitionSource for InMemoryPartitions {
    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn load(&self, index: usize) -> Result<DataFrame> {
        self.partitions.get(index).cloned().ok_or_else(|| {
            WipekitError::configuration(
                ErrorContext::new().partition(index),
                format!(
                    "partition index out of range ({} partitions)",
                    self.partitions.len()
                ),
            )
        })
    }

    fn row_count_hint(&self) -> Option<usize> {
        Some(self.partitions.iter().map(DataFrame::height).sum())
    }
}

/// Shared handle to a partition source.
#[derive(Debug, Clone)]
pub struct PartitionedDataset {
    source: Arc<dyn PartitionSource>,
}

impl PartitionedDataset {
    pub fn new(source: Arc<dyn PartitionSource>) -> Self {
        Self { source }
    }

    pub fn partition_count(&self) -> usize {
        self.source.partition_count()
    }

    pub fn load(&self, index: usize) -> Result<DataFrame> {
        self.source.load(index)
    }

    pub fn row_count_hint(&self) -> Option<usize> {
        self.source.row_count_hint()
    }
}

/// Input to every pipeline, schema and drift operation.
#[derive(Debug, Clone)]
pub enum Dataset {
    Eager(DataFrame),
    Partitioned(PartitionedDataset),
}

impl Dataset {
    pub fn eager(df: DataFrame) -> Self {
        Self::Eager(df)
    }

    pub fn partitioned(source: impl PartitionSource + 'static) -> Self {
        Self::Partitioned(PartitionedDataset::new(Arc::new(source)))
    }

    /// Split an in-memory frame into `count` partitions.
    pub fn from_frame_partitioned(df: &DataFrame, count: usize) -> Result<Self> {
        Ok(Self::partitioned(InMemoryPartitions::split(df, count)?))
    }

    pub fn partition_count(&self) -> usize {
        match self {
            Self::Eager(_) => 1,
            Self::Partitioned(p) => p.partition_count(),
        }
    }

    /// Row count if known without executing anything.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            Self::Eager(df) => Some(df.height()),
            Self::Partitioned(p) => p.row_count_hint(),
        }
    }

    /// Load one partition. An eager dataset is its own single partition.
    pub fn load_partition(&self, index: usize) -> Result<DataFrame> {
        match self {
            Self::Eager(df) if index == 0 => Ok(df.clone()),
            Self::Eager(_) => Err(WipekitError::configuration(
                ErrorContext::new().partition(index),
                "eager dataset has a single partition",
            )),
            Self::Partitioned(p) => p.load(index),
        }
    }

    /// Materialize every partition into one frame, in partition order.
    pub fn collect(&self) -> Result<DataFrame> {
        match self {
            Self::Eager(df) => Ok(df.clone()),
            Self::Partitioned(p) => {
                let count = p.partition_count();
                let mut acc: Option<DataFrame> = None;
                for index in 0..count {
                    let part = p.load(index)?;
                    acc = Some(match acc {
                        None => part,
                        Some(mut df) => {
                            df.vstack_mut(&part)?;
                            df
                        }
                    });
                }
                Ok(acc.unwrap_or_else(DataFrame::empty))
            }
        }
    }

    /// Column names of the first partition, without loading the rest.
    pub fn column_names(&self) -> Result<Vec<String>> {
        if self.partition_count() == 0 {
            return Ok(Vec::new());
        }
        let first = self.load_partition(0)?;
        Ok(crate::utils::column_names(&first))
    }
}

impl From<DataFrame> for Dataset {
    fn from(df: DataFrame) -> Self {
        Self::Eager(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes() {
        let df = df!["x" => (0..10).collect::<Vec<i64>>()].unwrap();
        let parts = InMemoryPartitions::split(&df, 4).unwrap();
        let heights: Vec<usize> = (0..4).map(|i| parts.load(i).unwrap().height()).collect();
        assert_eq!(heights, vec![3, 3, 2, 2]);
        assert_eq!(parts.row_count_hint(), Some(10));
    }

    #[test]
    fn test_split_more_partitions_than_rows() {
        let df = df!["x" => [1i64, 2, 3]].unwrap();
        let ds = Dataset::from_frame_partitioned(&df, 17).unwrap();
        assert_eq!(ds.partition_count(), 17);
        assert_eq!(ds.collect().unwrap().height(), 3);
    }

    #[test]
    fn test_collect_preserves_order() {
        let df = df!["x" => [1i64, 2, 3, 4, 5]].unwrap();
        let ds = Dataset::from_frame_partitioned(&df, 2).unwrap();
        assert!(ds.collect().unwrap().equals_missing(&df));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let df = df!["x" => [1i64]].unwrap();
        assert!(InMemoryPartitions::split(&df, 0).is_err());
    }

    #[test]
    fn test_eager_single_partition() {
        let df = df!["x" => [1i64]].unwrap();
        let ds = Dataset::from(df);
        assert_eq!(ds.partition_count(), 1);
        assert!(ds.load_partition(1).is_err());
    }
}
