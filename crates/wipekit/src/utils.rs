//! Shared utilities for stages, accumulators and schema inference.
//!
//! This module contains the helpers used to move values between polars
//! columns and plain vectors, so every stage reads and writes data the same
//! way regardless of the backend that calls it.

use crate::error::{ErrorContext, Result, WipekitError};
use polars::prelude::*;
use tracing::warn;

// =============================================================================
// Data Type Utilities
// =============================================================================

/// Category of a physical polars data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtypeCategory {
    /// Integer or floating point numbers
    Numeric,
    /// Date or datetime types
    Datetime,
    /// Boolean type
    Boolean,
    /// String/text type
    String,
    /// Null-typed column (every value missing)
    Null,
    /// Other/unknown types
    Other,
}

/// Check if a DataType is numeric (integer or float).
#[inline]
pub fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

/// Check if a DataType is a datetime type.
#[inline]
pub fn is_datetime_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Datetime(_, _) | DataType::Date | DataType::Time | DataType::Duration(_)
    )
}

/// Get the category of a DataType.
pub fn get_dtype_category(dtype: &DataType) -> DtypeCategory {
    if is_numeric_dtype(dtype) {
        DtypeCategory::Numeric
    } else if is_datetime_dtype(dtype) {
        DtypeCategory::Datetime
    } else if matches!(dtype, DataType::Boolean) {
        DtypeCategory::Boolean
    } else if matches!(dtype, DataType::String | DataType::Categorical(_, _)) {
        DtypeCategory::String
    } else if matches!(dtype, DataType::Null) {
        DtypeCategory::Null
    } else {
        DtypeCategory::Other
    }
}

// =============================================================================
// String Parsing Utilities
// =============================================================================

/// Characters commonly used in numeric formatting that should be stripped.
pub const NUMERIC_FORMAT_CHARS: [char; 6] = [',', '$', '%', '€', '£', ' '];

/// Common error/missing value markers in data.
pub const ERROR_MARKERS: [&str; 8] = [
    "error", "unknown", "n/a", "na", "null", "missing", "none", "#n/a",
];

/// Clean a string for numeric parsing by removing formatting characters.
pub fn clean_numeric_string(s: &str) -> String {
    let mut result = s.trim().to_string();
    for c in NUMERIC_FORMAT_CHARS {
        result = result.replace(c, "");
    }
    result
}

/// Check if a string is an error/missing value marker.
pub fn is_error_marker(s: &str) -> bool {
    let lower = s.trim().to_ascii_lowercase();
    lower.is_empty() || ERROR_MARKERS.iter().any(|&marker| lower == marker)
}

/// Try to parse a string as a numeric value (f64).
///
/// Handles common formatting like currency symbols, percentages, and thousands separators.
pub fn parse_numeric_string(s: &str) -> Option<f64> {
    let cleaned = clean_numeric_string(s);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Check if a string can be parsed as a numeric value.
pub fn is_numeric_string(s: &str) -> bool {
    parse_numeric_string(s).is_some()
}

// =============================================================================
// Column Access
// =============================================================================

/// Look up a column, turning absence into a schema mismatch.
pub fn require_column<'a>(df: &'a DataFrame, name: &str, stage: &str) -> Result<&'a Series> {
    df.column(name)
        .map(|c| c.as_materialized_series())
        .map_err(|_| {
            WipekitError::schema_mismatch(
                ErrorContext::new().stage(stage).column(name),
                format!("column '{name}' is not present"),
            )
        })
}

/// Read a column as optional floats.
///
/// Native numeric columns are cast. String columns are parsed; error markers
/// ("N/A", "null", empty) and unparseable values become missing, the latter
/// counted in a warning. Schema inference treats those values the same way.
pub fn numeric_values(series: &Series, stage: &str) -> Result<Vec<Option<f64>>> {
    match get_dtype_category(series.dtype()) {
        DtypeCategory::Numeric | DtypeCategory::Boolean => {
            let casted = series.cast(&DataType::Float64)?;
            Ok(casted.f64()?.into_iter().collect())
        }
        DtypeCategory::Null => Ok(vec![None; series.len()]),
        DtypeCategory::String => {
            let casted = series.cast(&DataType::String)?;
            let mut unparseable = 0usize;
            let values: Vec<Option<f64>> = casted
                .str()?
                .into_iter()
                .map(|value| match value {
                    Some(raw) if !is_error_marker(raw) => {
                        let parsed = parse_numeric_string(raw);
                        if parsed.is_none() {
                            unparseable += 1;
                        }
                        parsed
                    }
                    _ => None,
                })
                .collect();
            if unparseable > 0 {
                warn!(
                    stage,
                    column = %series.name(),
                    unparseable,
                    "non-numeric values read as missing"
                );
            }
            Ok(values)
        }
        _ => Err(WipekitError::schema_mismatch(
            ErrorContext::new().stage(stage).column(series.name().as_str()),
            format!("dtype {} cannot be read as numeric", series.dtype()),
        )),
    }
}

/// Read a column as optional strings (the category labels of its values).
pub fn string_values(series: &Series) -> Result<Vec<Option<String>>> {
    if matches!(series.dtype(), DataType::Null) {
        return Ok(vec![None; series.len()]);
    }
    let casted = series.cast(&DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Read an ordering key as floats. Numeric and temporal columns are
/// accepted; nulls are rejected because they have no position.
pub fn ordering_values(series: &Series, stage: &str) -> Result<Vec<f64>> {
    let ctx = || ErrorContext::new().stage(stage).column(series.name().as_str());
    let physical = match get_dtype_category(series.dtype()) {
        DtypeCategory::Numeric => series.cast(&DataType::Float64)?,
        DtypeCategory::Datetime => series.to_physical_repr().cast(&DataType::Float64)?,
        _ => {
            return Err(WipekitError::schema_mismatch(
                ctx(),
                format!("ordering key must be numeric or temporal, got {}", series.dtype()),
            ));
        }
    };
    physical
        .f64()?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| WipekitError::schema_mismatch(ctx(), "ordering key contains nulls"))
        })
        .collect()
}

/// Stable sort permutation of `keys` (ties keep their input order).
pub fn sort_permutation(keys: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..keys.len()).collect();
    idx.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
    idx
}

/// Gather rows of a DataFrame by position.
pub fn take_rows(df: &DataFrame, rows: &[usize]) -> Result<DataFrame> {
    let idx = IdxCa::from_vec(
        PlSmallStr::from_static("idx"),
        rows.iter().map(|&r| r as IdxSize).collect(),
    );
    Ok(df.take(&idx)?)
}

/// Replace (or append) a float column.
pub fn put_f64_column(df: &mut DataFrame, name: &str, values: Vec<Option<f64>>) -> Result<()> {
    df.with_column(Series::new(name.into(), values))?;
    Ok(())
}

/// Replace (or append) an integer column.
pub fn put_i64_column(df: &mut DataFrame, name: &str, values: Vec<Option<i64>>) -> Result<()> {
    df.with_column(Series::new(name.into(), values))?;
    Ok(())
}

/// Replace (or append) a string column.
pub fn put_str_column(df: &mut DataFrame, name: &str, values: Vec<Option<String>>) -> Result<()> {
    df.with_column(Series::new(name.into(), values))?;
    Ok(())
}

/// Names of all columns, owned.
pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_numeric_dtype() {
        assert!(is_numeric_dtype(&DataType::Int64));
        assert!(is_numeric_dtype(&DataType::Float64));
        assert!(!is_numeric_dtype(&DataType::String));
        assert!(!is_numeric_dtype(&DataType::Boolean));
    }

    #[test]
    fn test_dtype_category() {
        assert_eq!(get_dtype_category(&DataType::Int64), DtypeCategory::Numeric);
        assert_eq!(get_dtype_category(&DataType::Date), DtypeCategory::Datetime);
        assert_eq!(
            get_dtype_category(&DataType::Boolean),
            DtypeCategory::Boolean
        );
        assert_eq!(get_dtype_category(&DataType::String), DtypeCategory::String);
        assert_eq!(get_dtype_category(&DataType::Null), DtypeCategory::Null);
    }

    #[test]
    fn test_clean_numeric_string() {
        assert_eq!(clean_numeric_string("$1,234.56"), "1234.56");
        assert_eq!(clean_numeric_string("  42%  "), "42");
        assert_eq!(clean_numeric_string("1 000"), "1000");
    }

    #[test]
    fn test_is_error_marker() {
        assert!(is_error_marker("ERROR"));
        assert!(is_error_marker("N/A"));
        assert!(is_error_marker("  "));
        assert!(!is_error_marker("42"));
        assert!(!is_error_marker("hello"));
    }

    #[test]
    fn test_parse_numeric_string() {
        assert_eq!(parse_numeric_string("42"), Some(42.0));
        assert_eq!(parse_numeric_string("$1,234.56"), Some(1234.56));
        assert_eq!(parse_numeric_string("-100"), Some(-100.0));
        assert_eq!(parse_numeric_string(""), None);
        assert_eq!(parse_numeric_string("hello"), None);
    }

    #[test]
    fn test_numeric_values_from_strings() {
        let series = Series::new("x".into(), &[Some("1.5"), Some("N/A"), None, Some("$3")]);
        let values = numeric_values(&series, "test").unwrap();
        assert_eq!(values, vec![Some(1.5), None, None, Some(3.0)]);
    }

    #[test]
    fn test_numeric_values_reads_garbage_as_missing() {
        let series = Series::new("x".into(), &["1", "abc", "2"]);
        let values = numeric_values(&series, "standard_scale").unwrap();
        assert_eq!(values, vec![Some(1.0), None, Some(2.0)]);
    }

    #[test]
    fn test_numeric_values_rejects_other_dtypes() {
        let inner = Series::new("".into(), &[1i64, 2]);
        let series = Series::new("x".into(), &[inner]);
        let err = numeric_values(&series, "standard_scale").unwrap_err();
        assert!(matches!(err, WipekitError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("column=x"));
    }

    #[test]
    fn test_string_values_from_ints() {
        let series = Series::new("c".into(), &[Some(1i64), None, Some(3)]);
        let values = string_values(&series).unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }

    #[test]
    fn test_ordering_values_rejects_nulls() {
        let series = Series::new("t".into(), &[Some(1i64), None]);
        assert!(ordering_values(&series, "lag").is_err());
    }

    #[test]
    fn test_sort_permutation_is_stable() {
        let keys = [3.0, 1.0, 3.0, 2.0];
        assert_eq!(sort_permutation(&keys), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_take_rows() {
        let df = df!["a" => [10i64, 20, 30]].unwrap();
        let taken = take_rows(&df, &[2, 0]).unwrap();
        let a: Vec<Option<i64>> = taken
            .column("a")
            .unwrap()
            .as_materialized_series()
            .i64()
            .unwrap().into_iter().collect();
        assert_eq!(a, vec![Some(30), Some(10)]);
    }
}
