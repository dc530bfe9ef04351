//! Progress reporting and cancellation support for pipeline operations.
//!
//! This module provides types for tracking fit/transform progress and for
//! cancelling long-running work from another thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use wipekit::{CancellationToken, Pipeline};
//!
//! let token = CancellationToken::new();
//! let token_clone = token.clone();
//!
//! // In another thread
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     token_clone.cancel();
//! });
//!
//! let fitted = Pipeline::builder()
//!     .stages(configs)
//!     .cancellation_token(token)
//!     .on_progress(|update| {
//!         println!("[{:?}] {}", update.phase, update.message);
//!     })
//!     .build()?
//!     .fit(&dataset, &backend)?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Phases of a pipeline operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Static checks before any backend work
    Validating,
    /// Fitting stages in order
    Fitting,
    /// Capturing the reference snapshot
    Snapshot,
    /// Applying fitted stages
    Transforming,
    /// Applying inverse transforms in reverse order
    InverseTransforming,
    /// Operation completed successfully
    Complete,
    /// Operation was cancelled
    Cancelled,
    /// Operation failed with an error
    Failed,
}

impl PipelinePhase {
    /// Returns a human-readable name for the phase.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::Fitting => "Fitting Stages",
            Self::Snapshot => "Capturing Reference",
            Self::Transforming => "Transforming",
            Self::InverseTransforming => "Inverting",
            Self::Complete => "Complete",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }
}

/// Progress update with optional stage-level detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Current phase
    pub phase: PipelinePhase,

    /// Optional sub-stage description (e.g., "Stage 2/5: standard_scale")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<String>,

    /// Progress within the current phase (0.0 - 1.0)
    pub progress: f32,

    /// Human-readable message describing current activity
    pub message: String,

    /// Number of items processed in the current phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<usize>,

    /// Total items in the current phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_total: Option<usize>,
}

impl ProgressUpdate {
    pub fn new(phase: PipelinePhase, progress: f32, message: impl Into<String>) -> Self {
        Self {
            phase,
            sub_stage: None,
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            items_processed: None,
            items_total: None,
        }
    }

    /// Creates a progress update with item counts.
    pub fn with_items(
        phase: PipelinePhase,
        sub_stage: impl Into<String>,
        current: usize,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        let progress = if total > 0 {
            current as f32 / total as f32
        } else {
            0.0
        };
        Self {
            phase,
            sub_stage: Some(sub_stage.into()),
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            items_processed: Some(current),
            items_total: Some(total),
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(PipelinePhase::Complete, 1.0, message)
    }

    pub fn cancelled() -> Self {
        Self::new(PipelinePhase::Cancelled, 0.0, "Operation cancelled by user")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(PipelinePhase::Failed, 0.0, message)
    }
}

/// Receiver of progress updates.
///
/// Implementations must be `Send + Sync`; operations may run on a worker
/// thread while the reporter forwards updates elsewhere.
pub trait ProgressReporter: Send + Sync {
    /// Called once per stage boundary. Implementations should not block.
    fn report(&self, update: ProgressUpdate);
}

/// Wrapper that implements [`ProgressReporter`] using a closure.
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}

/// Token for cancelling running work.
///
/// Uses an atomic boolean internally, so clones share state and
/// [`cancel()`](Self::cancel) may be called from any thread. Pipelines check
/// it between stages and the partitioned backend checks it before each
/// partition task; a cancelled operation returns
/// [`WipekitError::Cancelled`](crate::error::WipekitError::Cancelled) and
/// produces no partial result.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// Tokens and updates cross into rayon workers
static_assertions::assert_impl_all!(CancellationToken: Send, Sync);
static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if [`cancel()`](Self::cancel) has been called on this
    /// token or any of its clones.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancellation_token_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();
        assert!(!token2.is_cancelled());

        token1.cancel();
        assert!(token2.is_cancelled());

        token2.reset();
        assert!(!token1.is_cancelled());
    }

    #[test]
    fn test_progress_update_with_items() {
        let update = ProgressUpdate::with_items(
            PipelinePhase::Fitting,
            "Stage 2/4: standard_scale",
            2,
            4,
            "Fitting standard_scale",
        );
        assert_eq!(update.phase, PipelinePhase::Fitting);
        assert_eq!(update.progress, 0.5);
        assert_eq!(update.items_total, Some(4));
    }

    #[test]
    fn test_progress_update_complete() {
        let update = ProgressUpdate::complete("Done");
        assert_eq!(update.phase, PipelinePhase::Complete);
        assert_eq!(update.progress, 1.0);
    }

    #[test]
    fn test_closure_progress_reporter() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let counter = call_count.clone();
        let reporter = ClosureProgressReporter::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        reporter.report(ProgressUpdate::new(PipelinePhase::Validating, 0.0, "a"));
        reporter.report(ProgressUpdate::complete("b"));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_progress_update_serialization() {
        let update = ProgressUpdate::new(PipelinePhase::InverseTransforming, 0.25, "x");
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("inverse_transforming"));
        assert!(!json.contains("sub_stage"));
    }
}
