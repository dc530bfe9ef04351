//! Single-pass backend over a fully materialized frame.

use super::{Combine, ExecutionBackend, MapPlan};
use crate::dataset::Dataset;
use crate::error::{Result, WipekitError};
use crate::pipeline::progress::CancellationToken;
use polars::prelude::DataFrame;
use tracing::debug;

/// Runs every operation on one in-memory frame.
///
/// Partitioned inputs are concatenated first, so window tasks see the whole
/// ordered history and never need a context.
#[derive(Debug, Clone, Default)]
pub struct EagerBackend {
    cancellation: Option<CancellationToken>,
}

impl EagerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(WipekitError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl ExecutionBackend for EagerBackend {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn aggregate<A, F>(&self, dataset: &Dataset, map: F) -> Result<A>
    where
        A: Combine,
        F: Fn(&DataFrame) -> Result<A> + Sync,
    {
        self.check_cancelled()?;
        if dataset.partition_count() == 0 {
            return Ok(A::default());
        }
        let df = dataset.collect()?;
        debug!(rows = df.height(), "eager aggregate");
        map(&df)
    }

    fn map_partitions<F>(&self, dataset: &Dataset, plan: &MapPlan, task: F) -> Result<Dataset>
    where
        F: Fn(&DataFrame, Option<&DataFrame>) -> Result<DataFrame> + Sync,
    {
        self.check_cancelled()?;
        let df = dataset.collect()?;
        debug!(rows = df.height(), task = %plan.label, "eager map");
        Ok(Dataset::Eager(task(&df, None)?))
    }
}
