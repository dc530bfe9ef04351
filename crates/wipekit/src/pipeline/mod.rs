//! Pipeline module.
//!
//! This module provides the preprocessing pipeline: building and fitting it,
//! applying the fitted result, and persisting it.

mod builder;
mod fitted;
pub mod progress;
mod serialization;

pub use builder::{Pipeline, PipelineBuilder};
pub use fitted::{FittedPipeline, FittedStage};
pub use progress::{
    CancellationToken, ClosureProgressReporter, PipelinePhase, ProgressReporter, ProgressUpdate,
};
pub use serialization::{FORMAT_VERSION, SerializedPipeline, SerializedStage};
