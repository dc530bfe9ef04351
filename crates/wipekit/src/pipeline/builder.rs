//! Main pipeline module.
//!
//! This module provides the `Pipeline` struct, which fits an ordered list of
//! stage configurations into a [`FittedPipeline`], and its builder.

use crate::backend::ExecutionBackend;
use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::drift::DriftMonitor;
use crate::error::{ErrorContext, Result, WipekitError};
use crate::pipeline::fitted::{FittedPipeline, FittedStage};
use crate::pipeline::progress::{
    CancellationToken, ClosureProgressReporter, PipelinePhase, ProgressReporter, ProgressUpdate,
};
use crate::schema::{Schema, SchemaRegistry};
use crate::stage::{self, Stage, StageConfig, StageRegistry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// An unfitted pipeline: validated stage configurations in order.
///
/// Use [`Pipeline::build`] for the common case or [`Pipeline::builder()`] to
/// declare a schema, a custom stage registry, progress reporting or
/// cancellation.
///
/// # Example
///
/// ```rust,ignore
/// use wipekit::{Pipeline, StageConfig, EagerBackend, Dataset};
///
/// let fitted = Pipeline::builder()
///     .stage(StageConfig::new("impute", ["age"]).param("strategy", "median"))
///     .stage(StageConfig::new("standard_scale", ["age"]))
///     .on_progress(|update| {
///         println!("[{:.0}%] {}", update.progress * 100.0, update.message);
///     })
///     .build()?
///     .fit(&Dataset::eager(df), &EagerBackend::new())?;
/// ```
pub struct Pipeline {
    stages: Vec<(StageConfig, Arc<dyn Stage>)>,
    schema: Option<Schema>,
    config: PipelineConfig,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: CancellationToken,
}

// Fitting may run on a worker thread
static_assertions::assert_impl_all!(Pipeline: Send, Sync);

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_configs().collect::<Vec<_>>())
            .field("schema", &self.schema)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build a pipeline from stage configurations using the bundled stages
    /// and default settings.
    pub fn build(configs: impl IntoIterator<Item = StageConfig>) -> Result<Self> {
        Self::builder().stages(configs).build()
    }

    pub fn stage_configs(&self) -> impl Iterator<Item = &StageConfig> {
        self.stages.iter().map(|(config, _)| config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fit every stage in order, each on the output of the stages before it.
    ///
    /// The input schema is the declared one (validated against the data) or
    /// inferred from the data. When `capture_reference` is set, a drift
    /// reference snapshot of the input is attached to the result.
    ///
    /// # Errors
    ///
    /// Returns `Err(WipekitError::Cancelled)` if the pipeline was cancelled
    /// via the cancellation token. Stage failures carry the stage kind in
    /// their context; partition failures are wrapped in `BackendExecution`.
    pub fn fit<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<FittedPipeline> {
        match self.fit_internal(dataset, backend) {
            Ok(fitted) => {
                self.report_progress(ProgressUpdate::complete("Pipeline fitted"));
                Ok(fitted)
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.report_progress(ProgressUpdate::cancelled());
                } else {
                    self.report_progress(ProgressUpdate::failed(e.to_string()));
                }
                error!("Pipeline fit failed: {}", e);
                Err(e)
            }
        }
    }

    /// Check if cancellation has been requested.
    fn check_cancelled(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(WipekitError::Cancelled);
        }
        Ok(())
    }

    /// Report progress if a reporter is configured.
    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.progress_reporter {
            reporter.report(update);
        }
    }

    fn fit_internal<B: ExecutionBackend>(
        &self,
        dataset: &Dataset,
        backend: &B,
    ) -> Result<FittedPipeline> {
        let start_time = Instant::now();
        info!(
            stages = self.stages.len(),
            partitions = dataset.partition_count(),
            backend = backend.name(),
            "Fitting pipeline"
        );
        self.report_progress(ProgressUpdate::new(
            PipelinePhase::Validating,
            0.0,
            "Resolving input schema",
        ));
        self.check_cancelled()?;

        let registry = SchemaRegistry::new(self.config.inference.clone());
        let input_schema = match &self.schema {
            Some(declared) => {
                registry.validate(dataset, declared, backend)?.into_result()?;
                declared.clone()
            }
            None => registry.infer(dataset, backend)?,
        };

        let total = self.stages.len();
        let mut schema = input_schema.clone();
        let mut current = dataset.clone();
        let mut fitted = Vec::with_capacity(total);
        for (index, (config, stage)) in self.stages.iter().enumerate() {
            self.check_cancelled()?;
            let kind = stage.kind();
            self.report_progress(ProgressUpdate::with_items(
                PipelinePhase::Fitting,
                format!("Stage {}/{}: {}", index + 1, total, kind),
                index,
                total,
                format!("Fitting {kind}"),
            ));
            stage::check_targets(stage.as_ref(), config, &schema)?;

            let acc = backend
                .aggregate(&current, |df| stage.accumulate(df, config).map_err(|e| e.in_stage(kind)))?;
            let state = stage.finalize(acc, config).map_err(|e| e.in_stage(kind))?;
            debug!(stage = kind, entries = state.len(), "stage fitted");

            schema = stage.output_schema(&schema, config, Some(&state))?.ok_or_else(|| {
                WipekitError::configuration(config.context(), "no output schema after fitting")
            })?;

            // The last stage's output is not needed to fit anything.
            if index + 1 < total {
                let plan = stage::map_plan(stage.as_ref(), config)?;
                current = backend.map_partitions(&current, &plan, |df, context| {
                    stage
                        .transform(df, &state, config, context)
                        .map_err(|e| e.in_stage(kind))
                })?;
            }
            fitted.push(FittedStage::new(config.clone(), state, Arc::clone(stage)));
        }

        self.check_cancelled()?;
        let reference = if self.config.capture_reference {
            self.report_progress(ProgressUpdate::new(
                PipelinePhase::Snapshot,
                0.0,
                "Capturing drift reference",
            ));
            let monitor = DriftMonitor::new(self.config.drift.clone());
            Some(monitor.snapshot(dataset, &input_schema, backend)?)
        } else {
            None
        };

        info!(
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            output_columns = schema.len(),
            "Pipeline fitted"
        );
        Ok(FittedPipeline::new(
            input_schema,
            schema,
            fitted,
            reference,
            self.config.drift.clone(),
            Utc::now(),
        )
        .with_cancellation(self.cancellation_token.clone())
        .with_reporter(self.progress_reporter.clone()))
    }
}

/// Builder for creating a [`Pipeline`] instance.
///
/// Use [`Pipeline::builder()`] to get started.
///
/// # Example
///
/// ```rust,ignore
/// use wipekit::{Pipeline, PipelineConfig, CancellationToken, Schema, ColumnType};
///
/// let token = CancellationToken::new();
/// let schema = Schema::builder()
///     .column("t", ColumnType::Numeric)
///     .column("price", ColumnType::Numeric)
///     .build()?;
///
/// let pipeline = Pipeline::builder()
///     .schema(schema)
///     .stage(StageConfig::new("lag", ["price"]).param("order_by", "t"))
///     .config(PipelineConfig::default())
///     .cancellation_token(token)
///     .build()?;
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    configs: Vec<StageConfig>,
    registry: Option<StageRegistry>,
    schema: Option<Schema>,
    config: Option<PipelineConfig>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: Option<CancellationToken>,
}

// Ensure PipelineBuilder is Send (can be moved to another thread during construction)
static_assertions::assert_impl_all!(PipelineBuilder: Send);

impl PipelineBuilder {
    /// Append one stage.
    pub fn stage(mut self, config: StageConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Append several stages in order.
    pub fn stages(mut self, configs: impl IntoIterator<Item = StageConfig>) -> Self {
        self.configs.extend(configs);
        self
    }

    /// Resolve stage kinds through `registry` instead of the bundled one.
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Declare the input schema instead of inferring it at fit time.
    ///
    /// Stage targets are then checked against it when the pipeline is built.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a progress reporter for receiving updates during fit and
    /// transform.
    pub fn progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    /// Set a progress callback closure.
    ///
    /// This is a convenience method for simple progress handling.
    /// For more complex scenarios, use [`progress_reporter`](Self::progress_reporter).
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
        self
    }

    /// Set a cancellation token for stopping the pipeline.
    ///
    /// Clone the token and call [`CancellationToken::cancel()`] from any
    /// thread. The pipeline checks it between stages and returns
    /// [`WipekitError::Cancelled`]; hand the same token to the backend to
    /// stop between partitions as well.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Build the pipeline.
    ///
    /// Every check that needs no data runs here: configuration values,
    /// stage kinds, hyperparameter names, and (with a declared schema)
    /// target presence and types as far as output schemas can be derived
    /// without fitted state.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| WipekitError::configuration(ErrorContext::new(), e.to_string()))?;
        let registry = self.registry.unwrap_or_else(StageRegistry::with_defaults);

        let mut stages = Vec::with_capacity(self.configs.len());
        for stage_config in self.configs {
            let stage = registry.get(&stage_config.kind)?;
            stage::check_config(stage.as_ref(), &stage_config)?;
            stages.push((stage_config, stage));
        }

        if let Some(declared) = &self.schema {
            let mut schema = Some(declared.clone());
            for (stage_config, stage) in &stages {
                let Some(current) = schema else { break };
                stage::check_targets(stage.as_ref(), stage_config, &current)?;
                schema = stage.output_schema(&current, stage_config, None)?;
            }
        }

        Ok(Pipeline {
            stages,
            schema: self.schema,
            config,
            progress_reporter: self.progress_reporter,
            cancellation_token: self.cancellation_token.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EagerBackend;
    use crate::schema::{ColumnType, Schema};
    use polars::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame() -> DataFrame {
        df![
            "age" => [Some(20.0), None, Some(40.0), Some(30.0)],
            "city" => ["a", "b", "a", "b"],
        ]
        .unwrap()
    }

    #[test]
    fn test_build_rejects_unknown_kind() {
        let err = Pipeline::build([StageConfig::new("nope", ["age"])]).unwrap_err();
        assert!(matches!(err, WipekitError::Configuration { .. }));
    }

    #[test]
    fn test_build_checks_targets_against_declared_schema() {
        let schema = Schema::builder()
            .column("age", ColumnType::Numeric)
            .build()
            .unwrap();
        let result = Pipeline::builder()
            .schema(schema)
            .stage(StageConfig::new("standard_scale", ["height"]))
            .build();
        assert!(matches!(result, Err(WipekitError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_build_stops_checking_after_state_dependent_schema() {
        let schema = Schema::builder()
            .column("city", ColumnType::Categorical)
            .build()
            .unwrap();
        // one_hot output columns are unknown until fit
        let pipeline = Pipeline::builder()
            .schema(schema)
            .stage(StageConfig::new("one_hot", ["city"]))
            .stage(StageConfig::new("standard_scale", ["city_a"]))
            .build();
        assert!(pipeline.is_ok());
    }

    #[test]
    fn test_fit_is_sequential_fold() {
        let pipeline = Pipeline::build([
            StageConfig::new("impute", ["age"]),
            StageConfig::new("standard_scale", ["age"]),
        ])
        .unwrap();
        let fitted = pipeline
            .fit(&Dataset::eager(frame()), &EagerBackend::new())
            .unwrap();
        // Scaling was fitted on imputed data, so its mean is the imputed mean
        let scale_state = fitted.stages()[1].state();
        assert_eq!(scale_state.number("age.mean").unwrap(), 30.0);
        assert!(fitted.reference().is_some());
    }

    #[test]
    fn test_fit_reports_progress() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pipeline = Pipeline::builder()
            .stage(StageConfig::new("trim_whitespace", ["city"]))
            .on_progress(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        pipeline
            .fit(&Dataset::eager(frame()), &EagerBackend::new())
            .unwrap();
        // validating, one stage, snapshot, complete
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_check_cancelled() {
        let token = CancellationToken::new();
        let pipeline = Pipeline::builder()
            .stage(StageConfig::new("impute", ["age"]))
            .cancellation_token(token.clone())
            .build()
            .unwrap();

        assert!(pipeline.check_cancelled().is_ok());

        token.cancel();
        let err = pipeline
            .fit(&Dataset::eager(frame()), &EagerBackend::new())
            .unwrap_err();
        assert!(matches!(err, WipekitError::Cancelled));
    }

    #[test]
    fn test_invalid_pipeline_config() {
        let mut config = PipelineConfig::default();
        config.drift.bins = 0;
        let result = Pipeline::builder().config(config).build();
        assert!(matches!(result, Err(WipekitError::Configuration { .. })));
    }
}
