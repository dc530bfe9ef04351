//! Standard and min-max scaling.

use super::{NUMERIC, accumulate_numeric, target_acc};
use crate::backend::StageAccumulator;
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue};
use crate::utils::{numeric_values, put_f64_column, require_column};
use polars::prelude::*;
use tracing::warn;

/// Apply `f` to every non-null value of each target column.
fn map_targets(
    partition: &DataFrame,
    config: &StageConfig,
    scaler: impl Fn(&str) -> Result<Box<dyn Fn(f64) -> f64>>,
) -> Result<DataFrame> {
    let mut out = partition.clone();
    for target in &config.target_columns {
        let series = require_column(partition, target, &config.kind)?;
        let apply = scaler(target)?;
        let values: Vec<Option<f64>> = numeric_values(series, &config.kind)?
            .into_iter()
            .map(|v| v.map(&apply))
            .collect();
        put_f64_column(&mut out, target, values)?;
    }
    Ok(out)
}

fn numeric_output(input: &Schema, config: &StageConfig) -> Schema {
    super::retype_targets(input, config, ColumnType::Numeric, None)
}

// =============================================================================
// Standard scaling
// =============================================================================

/// Centers on the mean and divides by the sample standard deviation.
///
/// A zero-variance column is centered only (scale 1) and a warning is logged.
/// Invertible unless `invertible: false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardScale;

impl StandardScale {
    fn params(state: &StageState, target: &str) -> Result<(f64, f64)> {
        Ok((
            state.number(&column_key(target, "mean"))?,
            state.number(&column_key(target, "scale"))?,
        ))
    }
}

impl Stage for StandardScale {
    fn kind(&self) -> &'static str {
        "standard_scale"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["with_mean", "with_std"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        config.get_bool("with_mean")?;
        config.get_bool("with_std")?;
        Ok(())
    }

    fn supports_inverse(&self, config: &StageConfig) -> bool {
        config.bool_or("invertible", true).unwrap_or(false)
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        Ok(Some(numeric_output(input, config)))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_numeric(partition, config, None)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let with_mean = config.bool_or("with_mean", true)?;
        let with_std = config.bool_or("with_std", true)?;
        let mut state = StageState::empty();
        for target in &config.target_columns {
            let ctx = || config.context().column(target.as_str());
            let moments = target_acc(&acc, config, target)?
                .moments
                .clone()
                .unwrap_or_default();
            let std = moments.sample_std().ok_or_else(|| {
                WipekitError::insufficient_data(
                    ctx(),
                    format!(
                        "standard deviation needs at least 2 non-null values, found {}",
                        moments.count
                    ),
                )
            })?;
            let scale = if !with_std {
                1.0
            } else if std == 0.0 || !std.is_finite() {
                warn!(column = %target, "zero variance; column will be centered only");
                1.0
            } else {
                std
            };
            let mean = if with_mean { moments.mean } else { 0.0 };
            state.insert(column_key(target, "mean"), StateValue::Number(mean));
            state.insert(column_key(target, "scale"), StateValue::Number(scale));
        }
        Ok(state)
    }

    fn transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        map_targets(partition, config, |target| {
            let (mean, scale) = Self::params(state, target)?;
            Ok(Box::new(move |x| (x - mean) / scale))
        })
    }

    fn inverse_transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
    ) -> Result<DataFrame> {
        if !self.supports_inverse(config) {
            return Err(WipekitError::capability(config.context(), "inverse_transform"));
        }
        map_targets(partition, config, |target| {
            let (mean, scale) = Self::params(state, target)?;
            Ok(Box::new(move |y| y * scale + mean))
        })
    }
}

// =============================================================================
// Min-max scaling
// =============================================================================

/// Maps the fitted `[min, max]` onto `[feature_min, feature_max]`
/// (default `[0, 1]`). A constant column maps to `feature_min`.
/// Invertible unless `invertible: false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMaxScale;

struct MinMaxParams {
    min: f64,
    range: f64,
    lo: f64,
    span: f64,
}

impl MinMaxScale {
    fn feature_range(config: &StageConfig) -> Result<(f64, f64)> {
        Ok((
            config.f64_or("feature_min", 0.0)?,
            config.f64_or("feature_max", 1.0)?,
        ))
    }

    fn params(state: &StageState, config: &StageConfig, target: &str) -> Result<MinMaxParams> {
        let (lo, hi) = Self::feature_range(config)?;
        let min = state.number(&column_key(target, "min"))?;
        let max = state.number(&column_key(target, "max"))?;
        Ok(MinMaxParams {
            min,
            range: max - min,
            lo,
            span: hi - lo,
        })
    }
}

impl Stage for MinMaxScale {
    fn kind(&self) -> &'static str {
        "minmax_scale"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["feature_min", "feature_max"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        let (lo, hi) = Self::feature_range(config)?;
        if lo >= hi {
            return Err(WipekitError::configuration(
                config.context(),
                format!("feature_min ({lo}) must be below feature_max ({hi})"),
            ));
        }
        Ok(())
    }

    fn supports_inverse(&self, config: &StageConfig) -> bool {
        config.bool_or("invertible", true).unwrap_or(false)
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        Ok(Some(numeric_output(input, config)))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_numeric(partition, config, None)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let mut state = StageState::empty();
        for target in &config.target_columns {
            let moments = target_acc(&acc, config, target)?
                .moments
                .clone()
                .unwrap_or_default();
            let (Some(min), Some(max)) = (moments.min, moments.max) else {
                return Err(WipekitError::insufficient_data(
                    config.context().column(target.as_str()),
                    "range of zero non-null values",
                ));
            };
            if min == max {
                warn!(column = %target, "constant column; values map to feature_min");
            }
            state.insert(column_key(target, "min"), StateValue::Number(min));
            state.insert(column_key(target, "max"), StateValue::Number(max));
        }
        Ok(state)
    }

    fn transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        map_targets(partition, config, |target| {
            let p = Self::params(state, config, target)?;
            Ok(Box::new(move |x| {
                if p.range == 0.0 {
                    p.lo
                } else {
                    (x - p.min) / p.range * p.span + p.lo
                }
            }))
        })
    }

    fn inverse_transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
    ) -> Result<DataFrame> {
        if !self.supports_inverse(config) {
            return Err(WipekitError::capability(config.context(), "inverse_transform"));
        }
        map_targets(partition, config, |target| {
            let p = Self::params(state, config, target)?;
            Ok(Box::new(move |y| {
                if p.range == 0.0 {
                    p.min
                } else {
                    (y - p.lo) / p.span * p.range + p.min
                }
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(stage: &dyn Stage, df: &DataFrame, config: &StageConfig) -> Result<StageState> {
        let acc = stage.accumulate(df, config)?;
        stage.finalize(acc, config)
    }

    fn floats(df: &DataFrame, name: &str) -> Vec<f64> {
        df.column(name)
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect()
    }

    #[test]
    fn test_standard_scale_roundtrip() {
        let df = df!["x" => [1.0, 2.0, 3.0, 4.0]].unwrap();
        let config = StageConfig::new("standard_scale", ["x"]);
        let state = fit(&StandardScale, &df, &config).unwrap();
        let out = StandardScale.transform(&df, &state, &config, None).unwrap();
        let scaled = floats(&out, "x");
        let mean: f64 = scaled.iter().sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);

        let back = StandardScale.inverse_transform(&out, &state, &config).unwrap();
        for (a, b) in floats(&back, "x").iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_standard_scale_single_value_is_insufficient() {
        let df = df!["x" => [Some(1.0), None]].unwrap();
        let config = StageConfig::new("standard_scale", ["x"]);
        let err = fit(&StandardScale, &df, &config).unwrap_err();
        assert!(matches!(err, WipekitError::InsufficientData { .. }));
    }

    #[test]
    fn test_standard_scale_zero_variance() {
        let df = df!["x" => [5.0, 5.0, 5.0]].unwrap();
        let config = StageConfig::new("standard_scale", ["x"]);
        let state = fit(&StandardScale, &df, &config).unwrap();
        assert_eq!(state.number("x.scale").unwrap(), 1.0);
        let out = StandardScale.transform(&df, &state, &config, None).unwrap();
        assert_eq!(floats(&out, "x"), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_standard_scale_inverse_disabled() {
        let config = StageConfig::new("standard_scale", ["x"]).param("invertible", false);
        assert!(!StandardScale.supports_inverse(&config));
        let df = df!["x" => [1.0]].unwrap();
        let err = StandardScale
            .inverse_transform(&df, &StageState::empty(), &config)
            .unwrap_err();
        assert!(matches!(err, WipekitError::Capability { .. }));
    }

    #[test]
    fn test_minmax_scale_custom_range() {
        let df = df!["x" => [Some(10.0), None, Some(20.0), Some(15.0)]].unwrap();
        let config = StageConfig::new("minmax_scale", ["x"])
            .param("feature_min", -1.0)
            .param("feature_max", 1.0);
        let state = fit(&MinMaxScale, &df, &config).unwrap();
        let out = MinMaxScale.transform(&df, &state, &config, None).unwrap();
        assert_eq!(floats(&out, "x"), vec![-1.0, 1.0, 0.0]);
        assert_eq!(out.column("x").unwrap().null_count(), 1);

        let back = MinMaxScale.inverse_transform(&out, &state, &config).unwrap();
        assert_eq!(floats(&back, "x"), vec![10.0, 20.0, 15.0]);
    }

    #[test]
    fn test_minmax_rejects_inverted_range() {
        let config = StageConfig::new("minmax_scale", ["x"])
            .param("feature_min", 1.0)
            .param("feature_max", 0.0);
        assert!(MinMaxScale.validate_config(&config).is_err());
    }
}
