//! Configuration types for pipelines, schema inference, execution and drift.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic pipeline setup. Every type here is serde
//! (de)serializable so configurations can be read from JSON files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Thresholds used when proposing a schema from data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Share of non-null string values that must parse as numbers (or match a
    /// date pattern) for the column to be typed numeric (or temporal).
    /// Default: 0.95
    pub numeric_ratio: f64,

    /// A string column is categorical when distinct values / non-null rows is
    /// below this ratio, otherwise text.
    /// Default: 0.5
    pub categorical_ratio: f64,

    /// Maximum number of distinct values tracked per column during inference.
    /// Columns exceeding it are treated as high cardinality (text).
    /// Default: 10_000
    pub max_tracked_distinct: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            numeric_ratio: 0.95,
            categorical_ratio: 0.5,
            max_tracked_distinct: 10_000,
        }
    }
}

/// Distance statistic used for numeric columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NumericDriftMethod {
    /// Population stability index over reference quantile bins
    #[default]
    Psi,
    /// Kolmogorov-Smirnov distance between quantile sketches
    Ks,
}

impl NumericDriftMethod {
    /// Conventional flagging threshold for the statistic.
    pub fn default_threshold(&self) -> f64 {
        match self {
            Self::Psi => 0.2,
            Self::Ks => 0.1,
        }
    }
}

/// Drift monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Statistic for numeric columns.
    /// Default: Psi
    pub numeric_method: NumericDriftMethod,

    /// Number of quantile bins in the reference histogram.
    /// Default: 10
    pub bins: usize,

    /// Global threshold. When `None` the method's conventional threshold is
    /// used (0.2 for PSI, 0.1 for KS).
    pub threshold: Option<f64>,

    /// Per-column threshold overrides.
    pub column_thresholds: BTreeMap<String, f64>,

    /// Floor applied to empty bin proportions before taking logarithms.
    /// Default: 1e-4
    pub epsilon: f64,

    /// Relative accuracy of the quantile sketch.
    /// Default: 0.01
    pub sketch_accuracy: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            numeric_method: NumericDriftMethod::default(),
            bins: 10,
            threshold: None,
            column_thresholds: BTreeMap::new(),
            epsilon: 1e-4,
            sketch_accuracy: 0.01,
        }
    }
}

impl DriftConfig {
    /// Threshold that applies to `column` for the given statistic family.
    pub fn threshold_for(&self, column: &str, categorical: bool) -> f64 {
        if let Some(t) = self.column_thresholds.get(column) {
            return *t;
        }
        if let Some(t) = self.threshold {
            return t;
        }
        if categorical {
            NumericDriftMethod::Psi.default_threshold()
        } else {
            self.numeric_method.default_threshold()
        }
    }
}

/// Settings for the partitioned backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker threads for partition tasks. `None` uses the rayon default.
    pub max_parallelism: Option<usize>,

    /// Per-partition deadline in milliseconds.
    pub partition_timeout_ms: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            partition_timeout_ms: None,
        }
    }
}

impl ExecutionConfig {
    pub fn partition_timeout(&self) -> Option<Duration> {
        self.partition_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration for a pipeline.
///
/// Use [`PipelineConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use wipekit::config::{PipelineConfig, NumericDriftMethod};
///
/// let config = PipelineConfig::builder()
///     .capture_reference(true)
///     .drift_method(NumericDriftMethod::Ks)
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Schema inference thresholds.
    pub inference: InferenceConfig,

    /// Drift monitor settings used for the reference snapshot.
    pub drift: DriftConfig,

    /// Partitioned backend settings.
    pub execution: ExecutionConfig,

    /// Whether `fit` captures a reference snapshot of its input.
    /// Default: true
    pub capture_reference: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            drift: DriftConfig::default(),
            execution: ExecutionConfig::default(),
            capture_reference: true,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let ratios = [
            ("inference.numeric_ratio", self.inference.numeric_ratio),
            ("inference.categorical_ratio", self.inference.categorical_ratio),
        ];
        for (field, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::InvalidThreshold {
                    field: field.to_string(),
                    value,
                });
            }
        }

        if self.drift.bins < 2 {
            return Err(ConfigValidationError::InvalidBins(self.drift.bins));
        }

        if !(self.drift.epsilon > 0.0 && self.drift.epsilon < 1.0) {
            return Err(ConfigValidationError::InvalidThreshold {
                field: "drift.epsilon".to_string(),
                value: self.drift.epsilon,
            });
        }

        if !(self.drift.sketch_accuracy > 0.0 && self.drift.sketch_accuracy < 1.0) {
            return Err(ConfigValidationError::InvalidThreshold {
                field: "drift.sketch_accuracy".to_string(),
                value: self.drift.sketch_accuracy,
            });
        }

        let thresholds = self
            .drift
            .threshold
            .iter()
            .map(|t| ("drift.threshold".to_string(), *t))
            .chain(
                self.drift
                    .column_thresholds
                    .iter()
                    .map(|(c, t)| (format!("drift.column_thresholds.{c}"), *t)),
            );
        for (field, value) in thresholds {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigValidationError::InvalidThreshold { field, value });
            }
        }

        if self.execution.max_parallelism == Some(0) {
            return Err(ConfigValidationError::InvalidParallelism);
        }

        if self.inference.max_tracked_distinct == 0 {
            return Err(ConfigValidationError::InvalidDistinctLimit);
        }

        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid value for '{field}': {value}")]
    InvalidThreshold { field: String, value: f64 },

    #[error("Invalid drift bin count: {0} (must be at least 2)")]
    InvalidBins(usize),

    #[error("Invalid parallelism: must be at least 1 worker")]
    InvalidParallelism,

    #[error("Invalid distinct tracking limit: must be at least 1")]
    InvalidDistinctLimit,
}

/// Builder for [`PipelineConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    inference: Option<InferenceConfig>,
    drift: Option<DriftConfig>,
    execution: Option<ExecutionConfig>,
    capture_reference: Option<bool>,
}

impl PipelineConfigBuilder {
    /// Set the schema inference thresholds.
    pub fn inference(mut self, inference: InferenceConfig) -> Self {
        self.inference = Some(inference);
        self
    }

    /// Set the drift monitor settings.
    pub fn drift(mut self, drift: DriftConfig) -> Self {
        self.drift = Some(drift);
        self
    }

    /// Set the numeric drift statistic, keeping other drift settings.
    pub fn drift_method(mut self, method: NumericDriftMethod) -> Self {
        let mut drift = self.drift.take().unwrap_or_default();
        drift.numeric_method = method;
        self.drift = Some(drift);
        self
    }

    /// Set the partitioned backend settings.
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Enable or disable reference snapshot capture during `fit`.
    pub fn capture_reference(mut self, capture: bool) -> Self {
        self.capture_reference = Some(capture);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `PipelineConfig` or an error if validation fails.
    pub fn build(self) -> Result<PipelineConfig, ConfigValidationError> {
        let config = PipelineConfig {
            inference: self.inference.unwrap_or_default(),
            drift: self.drift.unwrap_or_default(),
            execution: self.execution.unwrap_or_default(),
            capture_reference: self.capture_reference.unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.inference.numeric_ratio, 0.95);
        assert_eq!(config.drift.bins, 10);
        assert!(config.capture_reference);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_custom_values() {
        let config = PipelineConfig::builder()
            .drift_method(NumericDriftMethod::Ks)
            .capture_reference(false)
            .build()
            .unwrap();

        assert_eq!(config.drift.numeric_method, NumericDriftMethod::Ks);
        assert!(!config.capture_reference);
    }

    #[test]
    fn test_validation_invalid_ratio() {
        let result = PipelineConfig::builder()
            .inference(InferenceConfig {
                numeric_ratio: 1.5,
                ..Default::default()
            })
            .build();

        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidThreshold { .. }
        ));
    }

    #[test]
    fn test_validation_invalid_bins() {
        let result = PipelineConfig::builder()
            .drift(DriftConfig {
                bins: 1,
                ..Default::default()
            })
            .build();

        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidBins(1)
        ));
    }

    #[test]
    fn test_validation_zero_parallelism() {
        let result = PipelineConfig::builder()
            .execution(ExecutionConfig {
                max_parallelism: Some(0),
                partition_timeout_ms: None,
            })
            .build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidParallelism
        ));
    }

    #[test]
    fn test_threshold_resolution() {
        let mut drift = DriftConfig::default();
        assert_eq!(drift.threshold_for("x", false), 0.2);
        drift.numeric_method = NumericDriftMethod::Ks;
        assert_eq!(drift.threshold_for("x", false), 0.1);
        assert_eq!(drift.threshold_for("x", true), 0.2);
        drift.threshold = Some(0.5);
        assert_eq!(drift.threshold_for("x", false), 0.5);
        drift.column_thresholds.insert("x".to_string(), 0.05);
        assert_eq!(drift.threshold_for("x", false), 0.05);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "drift": { "numeric_method": "ks", "bins": 5 },
            "execution": { "max_parallelism": 4, "partition_timeout_ms": 2000 },
            "capture_reference": false
        }"#;

        let config: PipelineConfig = serde_json::from_str(json).expect("Should deserialize");

        assert_eq!(config.drift.numeric_method, NumericDriftMethod::Ks);
        assert_eq!(config.drift.bins, 5);
        assert_eq!(config.drift.epsilon, 1e-4);
        assert_eq!(
            config.execution.partition_timeout(),
            Some(Duration::from_millis(2000))
        );
        assert!(!config.capture_reference);
        assert_eq!(config.inference, InferenceConfig::default());
    }
}
