//! Drift monitoring.
//!
//! [`DriftMonitor::snapshot`] summarizes a reference dataset column by column
//! (moments, quantile sketch and quantile-binned histogram for numeric
//! columns, category frequencies for categorical ones).
//! [`DriftMonitor::compare`] measures how far a later batch has moved from
//! that summary and flags columns whose statistic exceeds the threshold.
//!
//! Text, temporal, geospatial, graph-id and unknown columns are not
//! monitored. Snapshots are values: comparing never changes them, and a new
//! reference is only produced by taking a new snapshot.

pub mod statistics;

use crate::backend::{
    ColumnAccumulator, Combine, ExecutionBackend, Frequencies, Histogram, Moments, QuantileSketch,
    StageAccumulator,
};
use crate::config::{DriftConfig, NumericDriftMethod};
use crate::dataset::Dataset;
use crate::error::{ErrorContext, Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::utils::{numeric_values, require_column, string_values};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Label used for the monitor in error context.
const MONITOR: &str = "drift_monitor";

/// Summary statistics of one reference column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSummary {
    Numeric {
        moments: Moments,
        sketch: QuantileSketch,
        histogram: Histogram,
    },
    Categorical {
        frequencies: Frequencies,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnReference {
    pub dtype: ColumnType,
    pub rows: u64,
    pub nulls: u64,
    pub summary: ColumnSummary,
}

impl ColumnReference {
    /// Distinct categories seen; `None` for numeric columns.
    pub fn cardinality(&self) -> Option<usize> {
        match &self.summary {
            ColumnSummary::Categorical { frequencies } => Some(frequencies.cardinality()),
            ColumnSummary::Numeric { .. } => None,
        }
    }
}

/// Per-column reference summary captured at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    /// Quantile bins requested for numeric histograms.
    pub bins: usize,
    pub columns: BTreeMap<String, ColumnReference>,
    /// Columns present in the schema but not monitored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl ReferenceSnapshot {
    pub fn column(&self, name: &str) -> Option<&ColumnReference> {
        self.columns.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatistic {
    /// Population stability index (numeric bins or categories)
    Psi,
    /// Kolmogorov-Smirnov distance
    Ks,
}

/// Drift measurement for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDrift {
    pub statistic: DriftStatistic,
    pub value: f64,
    pub threshold: f64,
    pub drifted: bool,
}

/// Result of comparing a batch against a reference snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub columns: BTreeMap<String, ColumnDrift>,
}

impl DriftReport {
    pub fn any_drift(&self) -> bool {
        self.columns.values().any(|c| c.drifted)
    }

    /// Names of the flagged columns, in column-name order.
    pub fn drifted_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, c)| c.drifted)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn get(&self, column: &str) -> Option<&ColumnDrift> {
        self.columns.get(column)
    }
}

/// Snapshots reference data and compares batches against it.
#[derive(Debug, Clone, Default)]
pub struct DriftMonitor {
    config: DriftConfig,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Summarize `dataset` for the numeric and categorical columns of
    /// `schema`. Takes two passes: the first learns quantile bin edges, the
    /// second fills the histograms.
    pub fn snapshot<B: ExecutionBackend>(
        &self,
        dataset: &Dataset,
        schema: &Schema,
        backend: &B,
    ) -> Result<ReferenceSnapshot> {
        let (monitored, skipped): (Vec<_>, Vec<_>) = schema
            .columns()
            .iter()
            .partition(|spec| matches!(spec.dtype, ColumnType::Numeric | ColumnType::Categorical));
        let monitored: Vec<(String, ColumnType)> = monitored
            .into_iter()
            .map(|spec| (spec.name.clone(), spec.dtype))
            .collect();
        let mut skipped: Vec<String> = skipped.into_iter().map(|spec| spec.name.clone()).collect();
        info!(columns = monitored.len(), backend = backend.name(), "capturing reference snapshot");

        let accuracy = self.config.sketch_accuracy;
        let summaries: StageAccumulator = backend.aggregate(dataset, |df| {
            let mut acc = StageAccumulator::new();
            for (name, dtype) in &monitored {
                let column = match dtype {
                    ColumnType::Numeric => ColumnAccumulator::numeric_with_sketch(
                        &numeric_column(df, name)?,
                        accuracy,
                    ),
                    _ => ColumnAccumulator::categorical(&string_values(require_column(
                        df, name, MONITOR,
                    )?)?),
                };
                acc.insert(name.as_str(), column);
            }
            Ok(acc)
        })?;

        let mut edges: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (name, dtype) in &monitored {
            if *dtype == ColumnType::Numeric
                && let Some(sketch) = summaries.column(name).and_then(|c| c.sketch.as_ref())
            {
                edges.insert(name.clone(), sketch.interior_quantiles(self.config.bins));
            }
        }

        let histograms: BTreeMap<String, Histogram> = backend.aggregate(dataset, |df| {
            let mut out = BTreeMap::new();
            for (name, column_edges) in &edges {
                out.insert(
                    name.clone(),
                    Histogram::from_values(column_edges.clone(), &numeric_column(df, name)?),
                );
            }
            Ok(out)
        })?;

        let mut columns = BTreeMap::new();
        for (name, dtype) in monitored {
            let acc = summaries.column(&name).cloned().unwrap_or_default();
            let (summary, non_null) = match dtype {
                ColumnType::Numeric => {
                    let moments = acc.moments.unwrap_or_default();
                    let count = moments.count;
                    let histogram = histograms
                        .get(&name)
                        .cloned()
                        .unwrap_or_else(|| Histogram::new(edges.get(&name).cloned().unwrap_or_default()));
                    (
                        ColumnSummary::Numeric {
                            moments,
                            sketch: acc.sketch.unwrap_or_else(|| QuantileSketch::new(accuracy)),
                            histogram,
                        },
                        count,
                    )
                }
                _ => {
                    let frequencies = acc.frequencies.unwrap_or_default();
                    let count = frequencies.non_null();
                    (ColumnSummary::Categorical { frequencies }, count)
                }
            };
            if non_null == 0 {
                warn!(column = %name, "no non-null reference values; column not monitored");
                skipped.push(name);
                continue;
            }
            debug!(column = %name, rows = acc.rows, non_null, "reference column summarized");
            columns.insert(
                name,
                ColumnReference {
                    dtype,
                    rows: acc.rows,
                    nulls: acc.rows - non_null,
                    summary,
                },
            );
        }
        skipped.sort();
        Ok(ReferenceSnapshot {
            bins: self.config.bins,
            columns,
            skipped,
        })
    }

    /// Compare `observation` against `reference`, column by column.
    ///
    /// Every monitored column must be present in the observation
    /// (`SchemaMismatch` otherwise); extra columns are ignored. A column with
    /// no non-null observed values is `InsufficientData`.
    pub fn compare<B: ExecutionBackend>(
        &self,
        reference: &ReferenceSnapshot,
        observation: &Dataset,
        backend: &B,
    ) -> Result<DriftReport> {
        let method = self.config.numeric_method;
        let observed: BTreeMap<String, Observed> = backend.aggregate(observation, |df| {
            let mut out = BTreeMap::new();
            for (name, column) in &reference.columns {
                let entry = match &column.summary {
                    ColumnSummary::Numeric { histogram, sketch, .. } => {
                        let values = numeric_column(df, name)?;
                        Observed {
                            histogram: Some(Histogram::from_values(histogram.edges.clone(), &values)),
                            sketch: (method == NumericDriftMethod::Ks)
                                .then(|| QuantileSketch::from_values(&values, sketch.relative_accuracy)),
                            frequencies: None,
                        }
                    }
                    ColumnSummary::Categorical { .. } => Observed {
                        frequencies: Some(Frequencies::from_values(&string_values(
                            require_column(df, name, MONITOR)?,
                        )?)),
                        ..Default::default()
                    },
                };
                out.insert(name.clone(), entry);
            }
            Ok(out)
        })?;

        let mut report = DriftReport::default();
        for (name, column) in &reference.columns {
            let seen = observed.get(name).cloned().unwrap_or_default();
            let ctx = || ErrorContext::new().stage(MONITOR).column(name.as_str());
            let (statistic, value, categorical) = match &column.summary {
                ColumnSummary::Numeric { histogram, sketch, .. } => {
                    let obs_hist = seen.histogram.unwrap_or_default();
                    if obs_hist.total() == 0 {
                        return Err(WipekitError::insufficient_data(
                            ctx(),
                            "no non-null observed values",
                        ));
                    }
                    match method {
                        NumericDriftMethod::Psi => (
                            DriftStatistic::Psi,
                            statistics::psi(
                                &histogram.proportions(),
                                &obs_hist.proportions(),
                                self.config.epsilon,
                            ),
                            false,
                        ),
                        NumericDriftMethod::Ks => (
                            DriftStatistic::Ks,
                            statistics::ks_statistic(sketch, &seen.sketch.unwrap_or_default()),
                            false,
                        ),
                    }
                }
                ColumnSummary::Categorical { frequencies } => {
                    let obs_freq = seen.frequencies.unwrap_or_default();
                    if obs_freq.non_null() == 0 {
                        return Err(WipekitError::insufficient_data(
                            ctx(),
                            "no non-null observed values",
                        ));
                    }
                    let (r, o) = statistics::category_proportions(frequencies, &obs_freq);
                    (
                        DriftStatistic::Psi,
                        statistics::psi(&r, &o, self.config.epsilon),
                        true,
                    )
                }
            };
            let threshold = self.config.threshold_for(name, categorical);
            let drifted = value > threshold;
            if drifted {
                warn!(column = %name, value, threshold, "drift detected");
            } else {
                debug!(column = %name, value, threshold, "no drift");
            }
            report.columns.insert(
                name.clone(),
                ColumnDrift {
                    statistic,
                    value,
                    threshold,
                    drifted,
                },
            );
        }
        info!(
            columns = report.columns.len(),
            drifted = report.drifted_columns().len(),
            "drift comparison complete"
        );
        Ok(report)
    }
}

/// Partial observation statistics for one column.
#[derive(Debug, Clone, Default)]
struct Observed {
    histogram: Option<Histogram>,
    sketch: Option<QuantileSketch>,
    frequencies: Option<Frequencies>,
}

impl Combine for Observed {
    fn combine(self, other: Self) -> Self {
        Self {
            histogram: self.histogram.combine(other.histogram),
            sketch: self.sketch.combine(other.sketch),
            frequencies: self.frequencies.combine(other.frequencies),
        }
    }
}

fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    numeric_values(require_column(df, name, MONITOR)?, MONITOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EagerBackend;
    use crate::schema::Schema;
    use polars::prelude::*;

    fn schema() -> Schema {
        Schema::builder()
            .column("x", ColumnType::Numeric)
            .column("c", ColumnType::Categorical)
            .column("note", ColumnType::Text)
            .build()
            .unwrap()
    }

    fn reference() -> Dataset {
        Dataset::eager(
            df![
                "x" => [1.0, 2.0, 2.0, 3.0, 2.0, 1.0, 3.0, 2.0],
                "c" => ["a", "b", "a", "b", "a", "b", "a", "b"],
                "note" => ["n1", "n2", "n3", "n4", "n5", "n6", "n7", "n8"],
            ]
            .unwrap(),
        )
    }

    #[test]
    fn test_snapshot_contents() {
        let monitor = DriftMonitor::default();
        let snapshot = monitor.snapshot(&reference(), &schema(), &EagerBackend::new()).unwrap();
        assert_eq!(snapshot.skipped, vec!["note".to_string()]);
        let x = snapshot.column("x").unwrap();
        let ColumnSummary::Numeric { histogram, moments, .. } = &x.summary else {
            panic!("x should be numeric");
        };
        assert_eq!(histogram.edges, vec![1.0, 1.4, 2.0, 2.6, 3.0]);
        assert_eq!(histogram.total(), 8);
        assert!((moments.mean - 2.0).abs() < 1e-12);
        assert_eq!(snapshot.column("c").unwrap().cardinality(), Some(2));
    }

    #[test]
    fn test_identical_batch_has_no_drift() {
        let monitor = DriftMonitor::default();
        let backend = EagerBackend::new();
        let snapshot = monitor.snapshot(&reference(), &schema(), &backend).unwrap();
        let report = monitor.compare(&snapshot, &reference(), &backend).unwrap();
        assert!(!report.any_drift());
        assert_eq!(report.get("x").unwrap().value, 0.0);
    }

    #[test]
    fn test_unseen_categories_drift() {
        let monitor = DriftMonitor::default();
        let backend = EagerBackend::new();
        let snapshot = monitor.snapshot(&reference(), &schema(), &backend).unwrap();
        let batch = Dataset::eager(
            df![
                "x" => [1.0, 2.0, 3.0, 2.0],
                "c" => ["z", "z", "z", "a"],
            ]
            .unwrap(),
        );
        let report = monitor.compare(&snapshot, &batch, &backend).unwrap();
        assert_eq!(report.drifted_columns(), vec!["c"]);
    }

    #[test]
    fn test_ks_method_and_overrides() {
        let mut config = DriftConfig {
            numeric_method: NumericDriftMethod::Ks,
            ..Default::default()
        };
        config.column_thresholds.insert("x".into(), 0.99);
        let monitor = DriftMonitor::new(config);
        let backend = EagerBackend::new();
        let snapshot = monitor.snapshot(&reference(), &schema(), &backend).unwrap();
        let batch = Dataset::eager(df!["x" => [10.0, 11.0], "c" => ["a", "b"]].unwrap());
        let report = monitor.compare(&snapshot, &batch, &backend).unwrap();
        let x = report.get("x").unwrap();
        assert_eq!(x.statistic, DriftStatistic::Ks);
        assert_eq!(x.value, 1.0);
        assert!(x.drifted);
        assert_eq!(report.get("c").unwrap().threshold, 0.2);
    }

    #[test]
    fn test_missing_column_is_schema_mismatch() {
        let monitor = DriftMonitor::default();
        let backend = EagerBackend::new();
        let snapshot = monitor.snapshot(&reference(), &schema(), &backend).unwrap();
        let batch = Dataset::eager(df!["x" => [1.0]].unwrap());
        let err = monitor.compare(&snapshot, &batch, &backend).unwrap_err();
        assert_eq!(err.root_cause().error_code(), "SCHEMA_MISMATCH");
    }

    #[test]
    fn test_observed_combine_keeps_counts() {
        let a = Observed {
            frequencies: Some(Frequencies::from_values(&[Some("a".into())])),
            ..Default::default()
        };
        let b = Observed {
            frequencies: Some(Frequencies::from_values(&[Some("a".into())])),
            ..Default::default()
        };
        assert_eq!(a.combine(b).frequencies.unwrap().non_null(), 2);
    }
}
