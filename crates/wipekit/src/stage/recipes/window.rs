//! Window stages over an ordering key.
//!
//! Rows are processed in ordering-key order, with the preceding rows handed
//! in by the backend prepended, and results are written back in the
//! partition's own row order. Ties in the key keep their input order.

use super::{NUMERIC, append_columns};
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnSpec, ColumnType, Schema};
use crate::stage::{Stage, StageCategory, StageConfig, StageState, output_collision};
use crate::utils::{numeric_values, ordering_values, put_f64_column, require_column, sort_permutation};
use polars::prelude::*;

/// Target values of `context` followed by those of `partition`, both in key
/// order, plus the permutation that sorted `partition`.
struct Ordered {
    values: Vec<Option<f64>>,
    offset: usize,
    permutation: Vec<usize>,
}

fn ordered_values(
    partition: &DataFrame,
    context: Option<&DataFrame>,
    target: &str,
    key: &str,
    kind: &str,
) -> Result<Ordered> {
    let sorted = |df: &DataFrame| -> Result<(Vec<Option<f64>>, Vec<usize>)> {
        let keys = ordering_values(require_column(df, key, kind)?, kind)?;
        let values = numeric_values(require_column(df, target, kind)?, kind)?;
        let permutation = sort_permutation(&keys);
        Ok((permutation.iter().map(|&i| values[i]).collect(), permutation))
    };
    let mut values = match context {
        Some(ctx) if ctx.height() > 0 => sorted(ctx)?.0,
        _ => Vec::new(),
    };
    let offset = values.len();
    let (own, permutation) = sorted(partition)?;
    values.extend(own);
    Ok(Ordered {
        values,
        offset,
        permutation,
    })
}

/// Scatter key-ordered results back to row order.
fn restore_order(ordered: &Ordered, results: Vec<Option<f64>>) -> Vec<Option<f64>> {
    let mut out = vec![None; ordered.permutation.len()];
    for (sorted_pos, &row) in ordered.permutation.iter().enumerate() {
        out[row] = results[ordered.offset + sorted_pos];
    }
    out
}

fn window_output(
    input: &Schema,
    config: &StageConfig,
    name: impl Fn(&str) -> String,
) -> Result<Option<Schema>> {
    let specs = config
        .target_columns
        .iter()
        .map(|t| ColumnSpec::new(name(t), ColumnType::Numeric));
    append_columns(input.clone(), config, specs).map(Some)
}

fn positive(config: &StageConfig, key: &str, default: usize) -> Result<usize> {
    let value = config.usize_or(key, default)?;
    if value == 0 {
        return Err(WipekitError::configuration(
            config.context(),
            format!("{key} must be at least 1"),
        ));
    }
    Ok(value)
}

fn write_outputs(
    partition: &DataFrame,
    context: Option<&DataFrame>,
    config: &StageConfig,
    kind: &str,
    name: impl Fn(&str) -> String,
    compute: impl Fn(&[Option<f64>]) -> Vec<Option<f64>>,
) -> Result<DataFrame> {
    let key = config.require_str("order_by")?;
    let mut out = partition.clone();
    for target in &config.target_columns {
        let output = name(target);
        if out.get_column_index(&output).is_some() {
            return Err(output_collision(config, &output));
        }
        let ordered = ordered_values(partition, context, target, key, kind)?;
        let results = compute(&ordered.values);
        put_f64_column(&mut out, &output, restore_order(&ordered, results))?;
    }
    Ok(out)
}

// =============================================================================
// Lag
// =============================================================================

/// Value of the row `periods` positions earlier in key order, as
/// `{column}_lag_{periods}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lag;

impl Lag {
    fn periods(config: &StageConfig) -> Result<usize> {
        positive(config, "periods", 1)
    }

    fn output_name(config: &StageConfig, target: &str) -> String {
        let periods = Self::periods(config).unwrap_or(1);
        format!("{target}_lag_{periods}")
    }
}

impl Stage for Lag {
    fn kind(&self) -> &'static str {
        "lag"
    }

    fn category(&self) -> StageCategory {
        StageCategory::Window
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["order_by", "periods"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        config.require_str("order_by")?;
        Self::periods(config).map(|_| ())
    }

    fn lookback(&self, config: &StageConfig) -> Result<usize> {
        Self::periods(config)
    }

    fn order_by(&self, config: &StageConfig) -> Result<Option<String>> {
        config.require_str("order_by").map(|k| Some(k.to_string()))
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        window_output(input, config, |t| Self::output_name(config, t))
    }

    fn transform(
        &self,
        partition: &DataFrame,
        _state: &StageState,
        config: &StageConfig,
        context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let periods = Self::periods(config)?;
        write_outputs(
            partition,
            context,
            config,
            self.kind(),
            |t| Self::output_name(config, t),
            |values| {
                (0..values.len())
                    .map(|j| j.checked_sub(periods).and_then(|i| values[i]))
                    .collect()
            },
        )
    }
}

// =============================================================================
// Rolling mean
// =============================================================================

/// Mean over the last `window` rows (current row included) in key order, as
/// `{column}_rolling_mean_{window}`. Nulls are skipped; fewer than
/// `min_periods` non-null values give null.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingMean;

impl RollingMean {
    fn window(config: &StageConfig) -> Result<usize> {
        config.get_usize("window")?.ok_or_else(|| {
            WipekitError::configuration(config.context(), "missing required hyperparameter 'window'")
        })?;
        positive(config, "window", 1)
    }

    fn min_periods(config: &StageConfig, window: usize) -> Result<usize> {
        let min = positive(config, "min_periods", 1)?;
        if min > window {
            return Err(WipekitError::configuration(
                config.context(),
                format!("min_periods ({min}) cannot exceed window ({window})"),
            ));
        }
        Ok(min)
    }

    fn output_name(config: &StageConfig, target: &str) -> String {
        let window = Self::window(config).unwrap_or(1);
        format!("{target}_rolling_mean_{window}")
    }
}

impl Stage for RollingMean {
    fn kind(&self) -> &'static str {
        "rolling_mean"
    }

    fn category(&self) -> StageCategory {
        StageCategory::Window
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["order_by", "window", "min_periods"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        config.require_str("order_by")?;
        let window = Self::window(config)?;
        Self::min_periods(config, window).map(|_| ())
    }

    fn lookback(&self, config: &StageConfig) -> Result<usize> {
        Ok(Self::window(config)? - 1)
    }

    fn order_by(&self, config: &StageConfig) -> Result<Option<String>> {
        config.require_str("order_by").map(|k| Some(k.to_string()))
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        window_output(input, config, |t| Self::output_name(config, t))
    }

    fn transform(
        &self,
        partition: &DataFrame,
        _state: &StageState,
        config: &StageConfig,
        context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let window = Self::window(config)?;
        let min_periods = Self::min_periods(config, window)?;
        write_outputs(
            partition,
            context,
            config,
            self.kind(),
            |t| Self::output_name(config, t),
            |values| {
                (0..values.len())
                    .map(|j| {
                        let start = (j + 1).saturating_sub(window);
                        let present: Vec<f64> = values[start..=j].iter().flatten().copied().collect();
                        (present.len() >= min_periods)
                            .then(|| present.iter().sum::<f64>() / present.len() as f64)
                    })
                    .collect()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(df: &DataFrame, name: &str) -> Vec<Option<f64>> {
        df.column(name)
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .collect()
    }

    fn shuffled() -> DataFrame {
        df![
            "t" => [3i64, 1, 2, 4],
            "x" => [30.0, 10.0, 20.0, 40.0],
        ]
        .unwrap()
    }

    #[test]
    fn test_lag_follows_key_not_row_order() {
        let config = StageConfig::new("lag", ["x"]).param("order_by", "t");
        let out = Lag
            .transform(&shuffled(), &StageState::empty(), &config, None)
            .unwrap();
        assert_eq!(
            floats(&out, "x_lag_1"),
            vec![Some(20.0), None, Some(10.0), Some(30.0)]
        );
    }

    #[test]
    fn test_lag_uses_context() {
        let config = StageConfig::new("lag", ["x"])
            .param("order_by", "t")
            .param("periods", 2);
        let context = df!["t" => [0i64, 1], "x" => [1.0, 2.0]].unwrap();
        let part = df!["t" => [2i64, 3], "x" => [3.0, 4.0]].unwrap();
        let out = Lag
            .transform(&part, &StageState::empty(), &config, Some(&context))
            .unwrap();
        assert_eq!(floats(&out, "x_lag_2"), vec![Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_rolling_mean_min_periods() {
        let config = StageConfig::new("rolling_mean", ["x"])
            .param("order_by", "t")
            .param("window", 2)
            .param("min_periods", 2);
        assert_eq!(RollingMean.lookback(&config).unwrap(), 1);
        let out = RollingMean
            .transform(&shuffled(), &StageState::empty(), &config, None)
            .unwrap();
        assert_eq!(
            floats(&out, "x_rolling_mean_2"),
            vec![Some(25.0), None, Some(15.0), Some(35.0)]
        );
    }

    #[test]
    fn test_window_config_checks() {
        let no_key = StageConfig::new("lag", ["x"]);
        assert!(Lag.validate_config(&no_key).is_err());
        let zero = StageConfig::new("lag", ["x"]).param("order_by", "t").param("periods", 0);
        assert!(Lag.validate_config(&zero).is_err());
        let no_window = StageConfig::new("rolling_mean", ["x"]).param("order_by", "t");
        assert!(RollingMean.validate_config(&no_window).is_err());
        let too_many = StageConfig::new("rolling_mean", ["x"])
            .param("order_by", "t")
            .param("window", 2)
            .param("min_periods", 3);
        assert!(RollingMean.validate_config(&too_many).is_err());
    }

    #[test]
    fn test_output_collision() {
        let schema = Schema::builder()
            .column("t", ColumnType::Numeric)
            .column("x", ColumnType::Numeric)
            .column("x_lag_1", ColumnType::Numeric)
            .build()
            .unwrap();
        let config = StageConfig::new("lag", ["x"]).param("order_by", "t");
        assert!(Lag.output_schema(&schema, &config, None).is_err());
    }
}
