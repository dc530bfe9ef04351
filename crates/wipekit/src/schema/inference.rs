//! Schema inference from data.
//!
//! Each partition yields an [`InferenceStats`] per column; the merged
//! statistics decide the logical type. Decisions follow the physical polars
//! dtype first and only inspect values for string columns.

use super::{ColumnSpec, ColumnType, Schema};
use crate::backend::{ExecutionBackend, InferenceStats, accumulators::PhysicalKind};
use crate::config::InferenceConfig;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::utils::{DtypeCategory, get_dtype_category, is_error_marker, is_numeric_string};
use once_cell::sync::Lazy;
use polars::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^\d{4}[-/]\d{1,2}[-/]\d{1,2}$").expect("Invalid regex: YYYY-MM-DD"),
        Regex::new(r"^\d{1,2}[-/]\d{1,2}[-/]\d{4}$").expect("Invalid regex: MM-DD-YYYY"),
        Regex::new(r"^\d{4}-\d{2}-\d{2}\s\d{2}:\d{2}:\d{2}").expect("Invalid regex: datetime"),
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").expect("Invalid regex: ISO"),
    ]
});

/// Whether a string looks like a date or timestamp.
pub fn looks_like_date(value: &str) -> bool {
    let trimmed = value.trim();
    DATE_PATTERNS.iter().any(|p| p.is_match(trimmed))
}

fn physical_kind(dtype: &DataType) -> PhysicalKind {
    match get_dtype_category(dtype) {
        DtypeCategory::Numeric => PhysicalKind::Numeric,
        DtypeCategory::Datetime => PhysicalKind::Temporal,
        DtypeCategory::Boolean => PhysicalKind::Boolean,
        DtypeCategory::String => PhysicalKind::String,
        DtypeCategory::Null => PhysicalKind::Null,
        DtypeCategory::Other => PhysicalKind::Other,
    }
}

/// Gather inference evidence from one column of one partition.
///
/// String error markers ("N/A", "null", empty) count as nulls.
pub fn observe_series(series: &Series, distinct_limit: usize) -> Result<InferenceStats> {
    let mut stats = InferenceStats::new(distinct_limit);
    stats.physical = physical_kind(series.dtype());
    stats.rows = series.len() as u64;
    stats.nulls = series.null_count() as u64;
    let non_null = stats.rows - stats.nulls;

    match stats.physical {
        PhysicalKind::Numeric => stats.numeric_like = non_null,
        PhysicalKind::Temporal => stats.temporal_like = non_null,
        PhysicalKind::Boolean => {
            let casted = series.cast(&DataType::String)?;
            for value in casted.str()?.into_iter().flatten() {
                stats.track_distinct(value);
            }
        }
        PhysicalKind::String => {
            let casted = series.cast(&DataType::String)?;
            for value in casted.str()?.into_iter().flatten() {
                if is_error_marker(value) {
                    stats.nulls += 1;
                    continue;
                }
                if is_numeric_string(value) {
                    stats.numeric_like += 1;
                } else if looks_like_date(value) {
                    stats.temporal_like += 1;
                }
                stats.track_distinct(value);
            }
        }
        PhysicalKind::Null | PhysicalKind::Other => {}
    }
    Ok(stats)
}

/// Gather inference evidence for every column of a partition.
pub fn observe_frame(
    df: &DataFrame,
    distinct_limit: usize,
) -> Result<BTreeMap<String, InferenceStats>> {
    let mut out = BTreeMap::new();
    for column in df.get_columns() {
        let series = column.as_materialized_series();
        out.insert(
            series.name().to_string(),
            observe_series(series, distinct_limit)?,
        );
    }
    Ok(out)
}

/// Logical type implied by merged evidence.
pub fn decide_type(stats: &InferenceStats, config: &InferenceConfig) -> ColumnType {
    let non_null = stats.non_null();
    if non_null == 0 {
        return ColumnType::Unknown;
    }
    match stats.physical {
        PhysicalKind::Numeric => ColumnType::Numeric,
        PhysicalKind::Temporal => ColumnType::Temporal,
        PhysicalKind::Boolean => ColumnType::Categorical,
        PhysicalKind::Null => ColumnType::Unknown,
        PhysicalKind::Other => ColumnType::Text,
        PhysicalKind::String => {
            let total = non_null as f64;
            if stats.numeric_like as f64 / total >= config.numeric_ratio {
                ColumnType::Numeric
            } else if stats.temporal_like as f64 / total >= config.numeric_ratio {
                ColumnType::Temporal
            } else if !stats.saturated
                && (stats.distinct.len() as f64 / total) < config.categorical_ratio
            {
                ColumnType::Categorical
            } else {
                ColumnType::Text
            }
        }
    }
}

/// Missing values a column of `dtype` carries once read.
///
/// String values that do not parse as numbers are read as missing by the
/// numeric stages, so they count as nulls for a numeric column.
pub fn effective_nulls(stats: &InferenceStats, dtype: ColumnType) -> u64 {
    if dtype == ColumnType::Numeric && stats.physical == PhysicalKind::String {
        stats.nulls + (stats.non_null() - stats.numeric_like)
    } else {
        stats.nulls
    }
}

/// Column order of the first partition, followed by any columns only later
/// partitions carry.
fn column_order(
    dataset: &Dataset,
    stats: &BTreeMap<String, InferenceStats>,
) -> Result<Vec<String>> {
    let mut order = dataset.column_names()?;
    for name in stats.keys() {
        if !order.contains(name) {
            order.push(name.clone());
        }
    }
    Ok(order)
}

pub(crate) fn infer_schema<B: ExecutionBackend>(
    dataset: &Dataset,
    backend: &B,
    config: &InferenceConfig,
) -> Result<Schema> {
    let limit = config.max_tracked_distinct;
    let stats: BTreeMap<String, InferenceStats> =
        backend.aggregate(dataset, |df| observe_frame(df, limit))?;

    let mut columns = Vec::with_capacity(stats.len());
    for name in column_order(dataset, &stats)? {
        let Some(column_stats) = stats.get(&name) else {
            continue;
        };
        let dtype = decide_type(column_stats, config);
        debug!(column = %name, dtype = %dtype, rows = column_stats.rows, "inferred column type");
        let nullable = effective_nulls(column_stats, dtype) > 0;
        columns.push(ColumnSpec::new(name, dtype).nullable(nullable));
    }
    info!(columns = columns.len(), backend = backend.name(), "schema inferred");
    Schema::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EagerBackend, PartitionedBackend};

    fn infer(df: DataFrame) -> Schema {
        infer_schema(&Dataset::from(df), &EagerBackend::new(), &InferenceConfig::default())
            .unwrap()
    }

    #[test]
    fn test_looks_like_date() {
        assert!(looks_like_date("2024-01-15"));
        assert!(looks_like_date("01/15/2024"));
        assert!(looks_like_date("2024-01-15T10:30:00"));
        assert!(!looks_like_date("hello"));
        assert!(!looks_like_date("12345"));
    }

    #[test]
    fn test_infer_basic_types() {
        let schema = infer(
            df![
                "num" => [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
                "num_str" => ["1", "2.5", "$3", "4", "1,000", "6"],
                "cat" => ["a", "b", "a", "a", "b", "a"],
                "text" => ["alpha", "beta", "gamma", "delta", "eps", "zeta"],
                "date" => ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05", "2024-01-06"],
                "flag" => [true, false, true, true, false, true],
            ]
            .unwrap(),
        );
        let dtype = |n: &str| schema.get(n).unwrap().dtype;
        assert_eq!(dtype("num"), ColumnType::Numeric);
        assert_eq!(dtype("num_str"), ColumnType::Numeric);
        assert_eq!(dtype("cat"), ColumnType::Categorical);
        assert_eq!(dtype("text"), ColumnType::Text);
        assert_eq!(dtype("date"), ColumnType::Temporal);
        assert_eq!(dtype("flag"), ColumnType::Categorical);
        assert_eq!(schema.names()[0], "num");
    }

    #[test]
    fn test_all_null_is_unknown_and_nullable() {
        let schema = infer(df!["empty" => [None::<f64>, None]].unwrap());
        let spec = schema.get("empty").unwrap();
        assert_eq!(spec.dtype, ColumnType::Unknown);
        assert!(spec.nullable);
    }

    #[test]
    fn test_error_markers_count_as_nulls() {
        let schema = infer(df!["x" => ["1", "N/A", "3", "4"]].unwrap());
        let spec = schema.get("x").unwrap();
        assert_eq!(spec.dtype, ColumnType::Numeric);
        assert!(spec.nullable);
    }

    #[test]
    fn test_numeric_column_with_junk_is_nullable_and_fits() {
        use crate::pipeline::Pipeline;
        use crate::stage::StageConfig;

        let mut values: Vec<String> = (0..30).map(|v| v.to_string()).collect();
        values[7] = "abc".to_string();
        let dataset = Dataset::from(df!["x" => values].unwrap());
        let schema = infer_schema(&dataset, &EagerBackend::new(), &InferenceConfig::default())
            .unwrap();
        let spec = schema.get("x").unwrap();
        assert_eq!(spec.dtype, ColumnType::Numeric);
        assert!(spec.nullable);

        let fitted = Pipeline::builder()
            .stage(StageConfig::new("standard_scale", ["x"]))
            .schema(schema)
            .build()
            .unwrap()
            .fit(&dataset, &EagerBackend::new())
            .unwrap();
        let out = fitted.transform(&dataset, &EagerBackend::new()).unwrap().collect().unwrap();
        let x = out.column("x").unwrap().as_materialized_series().f64().unwrap();
        assert_eq!(x.get(7), None);
        assert_eq!(x.null_count(), 1);
    }

    #[test]
    fn test_partitioned_inference_matches_eager() {
        let df = df![
            "x" => (0..40).map(|v| v as f64).collect::<Vec<_>>(),
            "c" => (0..40).map(|v| ["a", "b", "c"][v % 3]).collect::<Vec<_>>(),
        ]
        .unwrap();
        let eager = infer(df.clone());
        let ds = Dataset::from_frame_partitioned(&df, 6).unwrap();
        let partitioned =
            infer_schema(&ds, &PartitionedBackend::new().unwrap(), &InferenceConfig::default())
                .unwrap();
        assert_eq!(eager, partitioned);
    }

    #[test]
    fn test_saturated_distinct_is_text() {
        let config = InferenceConfig {
            max_tracked_distinct: 2,
            categorical_ratio: 0.99,
            ..Default::default()
        };
        let stats = observe_series(&Series::new("c".into(), &["a", "b", "c", "a"]), 2).unwrap();
        assert!(stats.saturated);
        assert_eq!(decide_type(&stats, &config), ColumnType::Text);
    }
}
