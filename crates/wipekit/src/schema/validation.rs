//! Dataset validation against a schema.

use super::inference::{decide_type, effective_nulls, observe_frame};
use super::{ColumnType, Schema};
use crate::backend::{ExecutionBackend, InferenceStats};
use crate::config::InferenceConfig;
use crate::dataset::Dataset;
use crate::error::{ErrorContext, Result, WipekitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// One way a dataset deviates from a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The column is absent from at least one partition.
    MissingColumn { column: String, partitions: u64 },
    /// The observed data cannot fill the declared type.
    IncompatibleType {
        column: String,
        expected: ColumnType,
        observed: ColumnType,
    },
    /// Nulls were found in a column declared non-nullable.
    NullsInNonNullable { column: String, null_count: u64 },
}

impl Violation {
    pub fn column(&self) -> &str {
        match self {
            Self::MissingColumn { column, .. }
            | Self::IncompatibleType { column, .. }
            | Self::NullsInNonNullable { column, .. } => column,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingColumn { column, partitions } => {
                write!(f, "'{column}' is missing from {partitions} partition(s)")
            }
            Self::IncompatibleType {
                column,
                expected,
                observed,
            } => write!(f, "'{column}' holds {observed} data, expected {expected}"),
            Self::NullsInNonNullable { column, null_count } => {
                write!(f, "'{column}' is not nullable but has {null_count} null(s)")
            }
        }
    }
}

/// Every violation found, in schema column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn a failed validation into a [`WipekitError::SchemaMismatch`].
    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let column = (self.violations.len() == 1).then(|| self.violations[0].column().to_string());
        let reason = self
            .violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let mut context = ErrorContext::new();
        if let Some(column) = column {
            context = context.column(column);
        }
        Err(WipekitError::schema_mismatch(context, reason))
    }
}

pub(crate) fn validate_dataset<B: ExecutionBackend>(
    dataset: &Dataset,
    schema: &Schema,
    backend: &B,
    config: &InferenceConfig,
) -> Result<ValidationResult> {
    let limit = config.max_tracked_distinct;
    let (observed, missing): (BTreeMap<String, InferenceStats>, BTreeMap<String, u64>) = backend
        .aggregate(dataset, |df| {
            let mut missing = BTreeMap::new();
            for spec in schema.columns() {
                if df.column(&spec.name).is_err() {
                    missing.insert(spec.name.clone(), 1u64);
                }
            }
            Ok((observe_frame(df, limit)?, missing))
        })?;

    let mut violations = Vec::new();
    for spec in schema.columns() {
        if let Some(&partitions) = missing.get(&spec.name) {
            violations.push(Violation::MissingColumn {
                column: spec.name.clone(),
                partitions,
            });
            continue;
        }
        let Some(stats) = observed.get(&spec.name) else {
            // zero partitions: nothing to check
            continue;
        };
        let observed_type = decide_type(stats, config);
        if !spec.dtype.accepts(observed_type, spec.nullable) {
            violations.push(Violation::IncompatibleType {
                column: spec.name.clone(),
                expected: spec.dtype,
                observed: observed_type,
            });
        }
        let nulls = effective_nulls(stats, spec.dtype);
        if !spec.nullable && nulls > 0 {
            violations.push(Violation::NullsInNonNullable {
                column: spec.name.clone(),
                null_count: nulls,
            });
        }
    }

    info!(
        violations = violations.len(),
        backend = backend.name(),
        "dataset validated"
    );
    Ok(ValidationResult { violations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EagerBackend, PartitionedBackend};
    use crate::schema::{ColumnSpec, Schema, SchemaRegistry};
    use polars::prelude::*;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::builder()
            .spec(ColumnSpec::new("x", ColumnType::Numeric).nullable(false))
            .column("c", ColumnType::Categorical)
            .column("t", ColumnType::Temporal)
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_dataset() {
        let df = df![
            "x" => [1.0, 2.0, 3.0],
            "c" => ["a", "b", "a"],
            "t" => ["2024-01-01", "2024-01-02", "2024-01-03"],
            "extra" => [1, 2, 3],
        ]
        .unwrap();
        let result = SchemaRegistry::default()
            .validate(&Dataset::from(df), &schema(), &EagerBackend::new())
            .unwrap();
        assert!(result.is_valid(), "{:?}", result.violations);
    }

    #[test]
    fn test_reports_every_violation() {
        let df = df![
            "x" => [Some("1"), Some("abc"), None],
            "c" => [1i64, 2, 3],
        ]
        .unwrap();
        let result = SchemaRegistry::default()
            .validate(&Dataset::from(df), &schema(), &EagerBackend::new())
            .unwrap();
        assert_eq!(
            result.violations,
            vec![
                Violation::IncompatibleType {
                    column: "x".into(),
                    expected: ColumnType::Numeric,
                    observed: ColumnType::Text,
                },
                Violation::NullsInNonNullable {
                    column: "x".into(),
                    null_count: 2,
                },
                Violation::MissingColumn {
                    column: "t".into(),
                    partitions: 1,
                },
            ]
        );
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_unparseable_values_count_as_nulls() {
        let values: Vec<String> = (0..30)
            .map(|v| if v == 3 { "abc".to_string() } else { v.to_string() })
            .collect();
        let df = df!["x" => values, "c" => ["a"; 30], "t" => ["2024-01-01"; 30]].unwrap();
        let result = SchemaRegistry::default()
            .validate(&Dataset::from(df), &schema(), &EagerBackend::new())
            .unwrap();
        assert_eq!(
            result.violations,
            vec![Violation::NullsInNonNullable {
                column: "x".into(),
                null_count: 1,
            }]
        );
    }

    #[test]
    fn test_partitioned_validation_counts_partitions() {
        let a = df!["x" => [1.0], "c" => ["a"], "t" => ["2024-01-01"]].unwrap();
        let b = df!["x" => [2.0], "c" => ["b"]].unwrap();
        let c = df!["x" => [3.0], "c" => ["a"]].unwrap();
        let ds = Dataset::partitioned(crate::dataset::InMemoryPartitions::new(vec![a, b, c]));
        let result = SchemaRegistry::default()
            .validate(&ds, &schema(), &PartitionedBackend::new().unwrap())
            .unwrap();
        assert_eq!(
            result.violations,
            vec![Violation::MissingColumn {
                column: "t".into(),
                partitions: 2,
            }]
        );
    }
}
