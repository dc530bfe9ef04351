//! Stateful Preprocessing Pipelines
//!
//! A preprocessing library built with Rust and Polars: pipelines of stages
//! are fitted once, then applied to any number of later batches with exactly
//! the parameters they learned, whether the data sits in one frame or is
//! split into partitions.
//!
//! # Overview
//!
//! - **Schemas**: Logical column types inferred from data or declared, and
//!   validated before any stage runs
//! - **Stages**: Cleaning, imputation, scaling, encoding, binning,
//!   anonymization and time-series features, each with serializable fitted
//!   state
//! - **Backends**: One in-memory frame or many partitions processed in
//!   parallel, with identical results either way
//! - **Persistence**: Fitted pipelines serialize to JSON and reload exactly
//! - **Drift Monitoring**: Reference snapshots compared against new batches
//!   with PSI or Kolmogorov-Smirnov statistics
//! - **Progress Reporting**: Progress updates with cancellation support
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use wipekit::{Dataset, EagerBackend, PartitionedBackend, Pipeline, StageConfig};
//! use polars::prelude::*;
//!
//! let train = CsvReadOptions::default()
//!     .try_into_reader_with_file_path(Some("train.csv".into()))?
//!     .finish()?;
//!
//! let fitted = Pipeline::build([
//!     StageConfig::new("impute", ["age"]).param("strategy", "median"),
//!     StageConfig::new("standard_scale", ["age"]),
//!     StageConfig::new("one_hot", ["city"]).param("handle_unknown", "bucket"),
//! ])?
//! .fit(&Dataset::eager(train), &EagerBackend::new())?;
//!
//! // Later batches, split into 8 partitions
//! let batch = Dataset::from_frame_partitioned(&new_rows, 8)?;
//! let out = fitted.transform(&batch, &PartitionedBackend::new())?.collect()?;
//!
//! // Persist
//! std::fs::write("pipeline.json", fitted.serialize().to_json()?)?;
//! ```
//!
//! # Drift
//!
//! With [`PipelineConfig::capture_reference`] set (the default), fitting
//! attaches a snapshot of the training input:
//!
//! ```rust,ignore
//! let report = fitted.check_drift(&batch, &PartitionedBackend::new())?;
//! for name in report.drifted_columns() {
//!     println!("{name} drifted");
//! }
//! let fitted = fitted.recalibrate(&batch, &PartitionedBackend::new())?;
//! ```
//!
//! # Extending
//!
//! Implement [`Stage`] and register it in a [`StageRegistry`] passed to
//! [`PipelineBuilder::registry`]; the same registry resolves kinds when
//! deserializing.

pub mod backend;
pub mod config;
pub mod dataset;
pub mod drift;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod stage;
pub mod utils;

// Re-exports for convenient access
pub use backend::{EagerBackend, ExecutionBackend, MapPlan, PartitionedBackend};
pub use config::{
    ConfigValidationError, DriftConfig, ExecutionConfig, InferenceConfig, NumericDriftMethod,
    PipelineConfig, PipelineConfigBuilder,
};
pub use dataset::{Dataset, InMemoryPartitions, PartitionSource, PartitionedDataset};
pub use drift::{
    ColumnDrift, ColumnReference, ColumnSummary, DriftMonitor, DriftReport, DriftStatistic,
    ReferenceSnapshot,
};
pub use error::{ErrorContext, Result as WipekitResult, ResultExt, WipekitError};
pub use pipeline::{
    CancellationToken, ClosureProgressReporter, FittedPipeline, FittedStage, Pipeline,
    PipelineBuilder, PipelinePhase, ProgressReporter, ProgressUpdate, SerializedPipeline,
    SerializedStage,
};
pub use schema::{
    ColumnRole, ColumnSpec, ColumnType, Schema, SchemaBuilder, SchemaRegistry, ValidationResult,
    Violation,
};
pub use stage::{Stage, StageCategory, StageConfig, StageRegistry, StageState, StateValue};
