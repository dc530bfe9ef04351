//! Fitted pipelines.

use crate::backend::{ExecutionBackend, MapPlan};
use crate::config::DriftConfig;
use crate::dataset::Dataset;
use crate::drift::{DriftMonitor, DriftReport, ReferenceSnapshot};
use crate::error::{ErrorContext, Result, WipekitError};
use crate::pipeline::progress::{CancellationToken, PipelinePhase, ProgressReporter, ProgressUpdate};
use crate::schema::Schema;
use crate::stage::{self, Stage, StageConfig, StageState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// A stage configuration together with the state fitted for it.
#[derive(Debug, Clone)]
pub struct FittedStage {
    config: StageConfig,
    state: StageState,
    stage: Arc<dyn Stage>,
}

impl FittedStage {
    pub(crate) fn new(config: StageConfig, state: StageState, stage: Arc<dyn Stage>) -> Self {
        Self {
            config,
            state,
            stage,
        }
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn state(&self) -> &StageState {
        &self.state
    }

    pub fn supports_inverse(&self) -> bool {
        self.stage.supports_inverse(&self.config)
    }

    fn transform<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<Dataset> {
        let kind = self.stage.kind();
        let plan = stage::map_plan(self.stage.as_ref(), &self.config)?;
        backend.map_partitions(dataset, &plan, |df, context| {
            self.stage
                .transform(df, &self.state, &self.config, context)
                .map_err(|e| e.in_stage(kind))
        })
    }

    fn inverse_transform<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<Dataset> {
        let kind = self.stage.kind();
        backend.map_partitions(dataset, &MapPlan::independent(kind), |df, _| {
            self.stage
                .inverse_transform(df, &self.state, &self.config)
                .map_err(|e| e.in_stage(kind))
        })
    }
}

/// The result of [`Pipeline::fit`](crate::Pipeline::fit): immutable stage
/// states in order, the schema they were fitted against and, optionally, a
/// drift reference of the training input.
///
/// Transforms are pure: the same input gives the same output on any backend
/// and any partitioning.
#[derive(Clone)]
pub struct FittedPipeline {
    input_schema: Arc<Schema>,
    output_schema: Arc<Schema>,
    stages: Vec<FittedStage>,
    reference: Option<ReferenceSnapshot>,
    drift: DriftConfig,
    fitted_at: DateTime<Utc>,
    cancellation: Option<CancellationToken>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
}

static_assertions::assert_impl_all!(FittedPipeline: Send, Sync);

impl std::fmt::Debug for FittedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FittedPipeline")
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("stages", &self.stages)
            .field("has_reference", &self.reference.is_some())
            .field("fitted_at", &self.fitted_at)
            .finish_non_exhaustive()
    }
}

impl FittedPipeline {
    pub(crate) fn new(
        input_schema: Schema,
        output_schema: Schema,
        stages: Vec<FittedStage>,
        reference: Option<ReferenceSnapshot>,
        drift: DriftConfig,
        fitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            input_schema: Arc::new(input_schema),
            output_schema: Arc::new(output_schema),
            stages,
            reference,
            drift,
            fitted_at,
            cancellation: None,
            progress_reporter: None,
        }
    }

    /// Check between stages during transforms.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_reporter(mut self, reporter: Option<Arc<dyn ProgressReporter>>) -> Self {
        self.progress_reporter = reporter;
        self
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn stages(&self) -> &[FittedStage] {
        &self.stages
    }

    pub fn reference(&self) -> Option<&ReferenceSnapshot> {
        self.reference.as_ref()
    }

    pub fn drift_config(&self) -> &DriftConfig {
        &self.drift
    }

    pub fn fitted_at(&self) -> DateTime<Utc> {
        self.fitted_at
    }

    fn check_cancelled(&self) -> Result<()> {
        if let Some(token) = &self.cancellation
            && token.is_cancelled()
        {
            return Err(WipekitError::Cancelled);
        }
        Ok(())
    }

    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.progress_reporter {
            reporter.report(update);
        }
    }

    /// Structural check of the first partition against the input schema.
    fn check_input(&self, dataset: &Dataset) -> Result<()> {
        if dataset.partition_count() == 0 {
            return Ok(());
        }
        match dataset {
            Dataset::Eager(df) => self.input_schema.check_structure(df),
            Dataset::Partitioned(_) => self
                .input_schema
                .check_structure(&dataset.load_partition(0)?),
        }
    }

    /// Apply every stage in order.
    pub fn transform<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<Dataset> {
        self.check_input(dataset)?;
        info!(
            stages = self.stages.len(),
            partitions = dataset.partition_count(),
            backend = backend.name(),
            "Transforming"
        );
        let total = self.stages.len();
        let mut current = dataset.clone();
        for (index, fitted) in self.stages.iter().enumerate() {
            self.check_cancelled()?;
            self.report_progress(ProgressUpdate::with_items(
                PipelinePhase::Transforming,
                format!("Stage {}/{}: {}", index + 1, total, fitted.kind()),
                index,
                total,
                format!("Applying {}", fitted.kind()),
            ));
            current = fitted.transform(&current, backend)?;
            debug!(stage = fitted.kind(), "stage applied");
        }
        self.report_progress(ProgressUpdate::complete("Transform complete"));
        Ok(current)
    }

    /// Undo the stages in reverse order.
    ///
    /// Fails with `Capability` before touching the data when any stage
    /// cannot be inverted.
    pub fn inverse_transform<B: ExecutionBackend>(
        &self,
        dataset: &Dataset,
        backend: &B,
    ) -> Result<Dataset> {
        if let Some(blocking) = self.stages.iter().find(|s| !s.supports_inverse()) {
            return Err(WipekitError::capability(
                ErrorContext::new().stage(blocking.kind()),
                "inverse_transform",
            ));
        }
        let total = self.stages.len();
        let mut current = dataset.clone();
        for (done, fitted) in self.stages.iter().rev().enumerate() {
            self.check_cancelled()?;
            self.report_progress(ProgressUpdate::with_items(
                PipelinePhase::InverseTransforming,
                format!("Stage {}/{}: {}", total - done, total, fitted.kind()),
                done,
                total,
                format!("Inverting {}", fitted.kind()),
            ));
            current = fitted.inverse_transform(&current, backend)?;
        }
        self.report_progress(ProgressUpdate::complete("Inverse transform complete"));
        Ok(current)
    }

    /// Compare a batch against the attached reference snapshot.
    pub fn check_drift<B: ExecutionBackend>(&self, batch: &Dataset, backend: &B) -> Result<DriftReport> {
        let reference = self.reference.as_ref().ok_or_else(|| {
            WipekitError::configuration(
                ErrorContext::new(),
                "pipeline has no drift reference; fit with capture_reference or recalibrate",
            )
        })?;
        DriftMonitor::new(self.drift.clone()).compare(reference, batch, backend)
    }

    /// A copy of this pipeline whose drift reference is a fresh snapshot of
    /// `dataset`. Stage states are left as they are.
    pub fn recalibrate<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<Self> {
        self.report_progress(ProgressUpdate::new(
            PipelinePhase::Snapshot,
            0.0,
            "Recalibrating drift reference",
        ));
        let snapshot =
            DriftMonitor::new(self.drift.clone()).snapshot(dataset, &self.input_schema, backend)?;
        info!(columns = snapshot.columns.len(), "drift reference recalibrated");
        Ok(Self {
            reference: Some(snapshot),
            ..self.clone()
        })
    }
}
