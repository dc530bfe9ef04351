//! Error types for the transformation pipeline.
//!
//! Every failure the core can produce is a [`WipekitError`]. Domain variants
//! carry an [`ErrorContext`] naming the stage kind, target column and
//! partition index involved, so errors are actionable without a backtrace.
//!
//! Errors are serializable (code + message) so they can cross an IPC or
//! HTTP boundary unchanged.

use serde::Serialize;
use serde::ser::SerializeStruct;
use std::fmt;
use thiserror::Error;

/// Where an error happened: stage kind, column and partition, when known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub stage: Option<String>,
    pub column: Option<String>,
    pub partition: Option<usize>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn partition(mut self, partition: usize) -> Self {
        self.partition = Some(partition);
        self
    }

    fn is_empty(&self) -> bool {
        self.stage.is_none() && self.column.is_none() && self.partition.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::with_capacity(3);
        if let Some(stage) = &self.stage {
            parts.push(format!("stage={stage}"));
        }
        if let Some(column) = &self.column {
            parts.push(format!("column={column}"));
        }
        if let Some(partition) = self.partition {
            parts.push(format!("partition={partition}"));
        }
        write!(f, " [{}]", parts.join(", "))
    }
}

/// The main error type of the crate.
#[derive(Error, Debug)]
pub enum WipekitError {
    /// Structural or type incompatibility between a dataset and a schema or
    /// a stage's expectations.
    #[error("Schema mismatch{context}: {reason}")]
    SchemaMismatch { context: ErrorContext, reason: String },

    /// A statistic cannot be computed from the available data.
    #[error("Insufficient data{context}: {reason}")]
    InsufficientData { context: ErrorContext, reason: String },

    /// An operation was invoked on a stage or pipeline lacking the capability.
    #[error("Capability error{context}: {operation} is not supported")]
    Capability {
        context: ErrorContext,
        operation: String,
    },

    /// A failure inside partition execution. Wraps the first partition-level
    /// failure.
    #[error("Backend execution failed in partition {partition}: {source}")]
    BackendExecution {
        partition: usize,
        #[source]
        source: Box<WipekitError>,
    },

    /// Malformed stage configuration or pipeline setup.
    #[error("Configuration error{context}: {reason}")]
    Configuration { context: ErrorContext, reason: String },

    /// A partition task ran past its configured deadline.
    #[error("Partition {partition} exceeded its timeout of {timeout_ms}ms")]
    PartitionTimeout { partition: usize, timeout_ms: u64 },

    /// The operation was cancelled through a cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A serialized pipeline could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<WipekitError>,
    },
}

impl WipekitError {
    pub fn schema_mismatch(context: ErrorContext, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            context,
            reason: reason.into(),
        }
    }

    pub fn insufficient_data(context: ErrorContext, reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            context,
            reason: reason.into(),
        }
    }

    pub fn capability(context: ErrorContext, operation: impl Into<String>) -> Self {
        Self::Capability {
            context,
            operation: operation.into(),
        }
    }

    pub fn configuration(context: ErrorContext, reason: impl Into<String>) -> Self {
        Self::Configuration {
            context,
            reason: reason.into(),
        }
    }

    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        WipekitError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attach a stage kind to a domain error that has none yet.
    pub fn in_stage(mut self, stage: &str) -> Self {
        if let Some(ctx) = self.context_mut()
            && ctx.stage.is_none()
        {
            ctx.stage = Some(stage.to_string());
        }
        self
    }

    /// Attach a partition index to a domain error that has none yet.
    pub fn in_partition(mut self, partition: usize) -> Self {
        if let Some(ctx) = self.context_mut()
            && ctx.partition.is_none()
        {
            ctx.partition = Some(partition);
        }
        self
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::SchemaMismatch { context, .. }
            | Self::InsufficientData { context, .. }
            | Self::Capability { context, .. }
            | Self::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Error context of a domain error, looking through wrappers.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self.root_cause() {
            Self::SchemaMismatch { context, .. }
            | Self::InsufficientData { context, .. }
            | Self::Capability { context, .. }
            | Self::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The innermost error, unwrapping backend and context wrappers.
    pub fn root_cause(&self) -> &WipekitError {
        match self {
            Self::BackendExecution { source, .. } | Self::WithContext { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Get error code for frontend handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Self::InsufficientData { .. } => "INSUFFICIENT_DATA",
            Self::Capability { .. } => "CAPABILITY",
            Self::BackendExecution { .. } => "BACKEND_EXECUTION",
            Self::Configuration { .. } => "CONFIGURATION",
            Self::PartitionTimeout { .. } => "PARTITION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Check if this error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }

    /// Validation-type errors are detected before backend work starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::SchemaMismatch { .. } | Self::Configuration { .. }
        )
    }
}

/// Serialized as a struct with `code` and `message` fields.
impl Serialize for WipekitError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("WipekitError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, WipekitError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| WipekitError::Polars(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(WipekitError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            WipekitError::schema_mismatch(ErrorContext::new(), "x").error_code(),
            "SCHEMA_MISMATCH"
        );
    }

    #[test]
    fn test_context_display() {
        let err = WipekitError::insufficient_data(
            ErrorContext::new().stage("standard_scale").column("age"),
            "need at least 2 values",
        );
        let msg = err.to_string();
        assert!(msg.contains("stage=standard_scale"));
        assert!(msg.contains("column=age"));
        assert!(!msg.contains("partition"));
    }

    #[test]
    fn test_root_cause_through_backend_wrapper() {
        let inner = WipekitError::schema_mismatch(ErrorContext::new().column("x"), "missing");
        let err = WipekitError::BackendExecution {
            partition: 3,
            source: Box::new(inner.in_partition(3)),
        };
        assert_eq!(err.error_code(), "BACKEND_EXECUTION");
        assert!(matches!(
            err.root_cause(),
            WipekitError::SchemaMismatch { .. }
        ));
        assert_eq!(err.context().and_then(|c| c.partition), Some(3));
    }

    #[test]
    fn test_in_stage_keeps_existing_stage() {
        let err = WipekitError::configuration(ErrorContext::new().stage("one_hot"), "bad")
            .in_stage("label_encode");
        assert_eq!(
            err.context().and_then(|c| c.stage.clone()),
            Some("one_hot".to_string())
        );
    }

    #[test]
    fn test_is_cancelled_through_wrapper() {
        let err = WipekitError::Cancelled.with_context("During fit");
        assert!(err.is_cancelled());
        assert_eq!(err.error_code(), "CANCELLED");
    }

    #[test]
    fn test_error_serialization() {
        let error = WipekitError::capability(ErrorContext::new().stage("one_hot"), "inverse_transform");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("CAPABILITY"));
        assert!(json.contains("one_hot"));
    }
}
