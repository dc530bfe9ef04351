//! Statistical imputation.
//!
//! Fills nulls with a statistic learned at fit time: mean, median (from the
//! quantile sketch, exact on small columns), mode (ties go to the
//! lexicographically smallest label) or a configured constant.

use super::{NUMERIC, accumulate_categorical, accumulate_numeric, sketch_accuracy, target_acc};
use crate::backend::StageAccumulator;
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue};
use crate::utils::{
    DtypeCategory, get_dtype_category, numeric_values, parse_numeric_string, put_f64_column,
    put_str_column, require_column, string_values,
};
use polars::prelude::*;
use serde_json::Value;
use tracing::debug;

const ANY_FILLABLE: &[ColumnType] = &[
    ColumnType::Numeric,
    ColumnType::Categorical,
    ColumnType::Text,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Mean,
    Median,
    Mode,
    Constant,
}

impl Strategy {
    fn from_config(config: &StageConfig) -> Result<Self> {
        Ok(
            match config.choice("strategy", &["mean", "median", "mode", "constant"], "mean")? {
                "median" => Self::Median,
                "mode" => Self::Mode,
                "constant" => Self::Constant,
                _ => Self::Mean,
            },
        )
    }
}

/// Null imputation with a learned or constant fill value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Impute;

impl Impute {
    fn fill_key(target: &str) -> String {
        column_key(target, "fill")
    }
}

impl Stage for Impute {
    fn kind(&self) -> &'static str {
        "impute"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["strategy", "fill_value", "sketch_accuracy"]
    }

    fn accepted_types(&self, config: &StageConfig) -> &'static [ColumnType] {
        match Strategy::from_config(config) {
            Ok(Strategy::Mean | Strategy::Median) => NUMERIC,
            _ => ANY_FILLABLE,
        }
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        let strategy = Strategy::from_config(config)?;
        sketch_accuracy(config)?;
        match (strategy, config.get("fill_value")) {
            (Strategy::Constant, Some(Value::Number(_) | Value::String(_))) => Ok(()),
            (Strategy::Constant, _) => Err(WipekitError::configuration(
                config.context(),
                "strategy 'constant' needs a numeric or string 'fill_value'",
            )),
            (_, Some(_)) => Err(WipekitError::configuration(
                config.context(),
                "'fill_value' is only used with strategy 'constant'",
            )),
            (_, None) => Ok(()),
        }
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        let mut out = input.clone();
        for target in &config.target_columns {
            if let Some(spec) = input.get(target) {
                let mut next = spec.clone();
                if next.dtype == ColumnType::Unknown {
                    next.dtype = match config.get("fill_value") {
                        Some(Value::Number(_)) => ColumnType::Numeric,
                        _ => ColumnType::Categorical,
                    };
                }
                next.nullable = false;
                out = out.upsert(next);
            }
        }
        Ok(Some(out))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        match Strategy::from_config(config)? {
            Strategy::Mean => accumulate_numeric(partition, config, None),
            Strategy::Median => {
                accumulate_numeric(partition, config, Some(sketch_accuracy(config)?))
            }
            Strategy::Mode => accumulate_categorical(partition, config),
            Strategy::Constant => Ok(StageAccumulator::default()),
        }
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let strategy = Strategy::from_config(config)?;
        let mut state = StageState::empty();
        for target in &config.target_columns {
            let ctx = || config.context().column(target.as_str());
            let fill = match strategy {
                Strategy::Constant => match config.get("fill_value") {
                    Some(Value::Number(n)) => StateValue::Number(n.as_f64().unwrap_or_default()),
                    Some(Value::String(s)) => StateValue::Text(s.clone()),
                    _ => {
                        return Err(WipekitError::configuration(ctx(), "missing 'fill_value'"));
                    }
                },
                Strategy::Mean => {
                    let column = target_acc(&acc, config, target)?;
                    let moments = column.moments.as_ref().filter(|m| m.count > 0).ok_or_else(|| {
                        WipekitError::insufficient_data(ctx(), "mean of zero non-null values")
                    })?;
                    StateValue::Number(moments.mean)
                }
                Strategy::Median => {
                    let column = target_acc(&acc, config, target)?;
                    let median = column
                        .sketch
                        .as_ref()
                        .and_then(|s| s.quantile(0.5))
                        .ok_or_else(|| {
                            WipekitError::insufficient_data(ctx(), "median of zero non-null values")
                        })?;
                    StateValue::Number(median)
                }
                Strategy::Mode => {
                    let column = target_acc(&acc, config, target)?;
                    let mode = column
                        .frequencies
                        .as_ref()
                        .and_then(|f| f.mode())
                        .ok_or_else(|| {
                            WipekitError::insufficient_data(ctx(), "mode of zero non-null values")
                        })?;
                    StateValue::Text(mode.to_string())
                }
            };
            debug!(column = %target, fill = ?fill, "impute fill value");
            state.insert(Self::fill_key(target), fill);
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
        let strategy = Strategy::from_config(config)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let series = require_column(partition, target, self.kind())?;
            let ctx = || config.context().column(target.as_str());
            let fill = state
                .get(&Self::fill_key(target))
                .ok_or_else(|| WipekitError::configuration(ctx(), "fitted state has no fill value"))?;
            let category = get_dtype_category(series.dtype());
            let numeric_storage = category == DtypeCategory::Numeric;

            match fill {
                // A numeric constant on a string column stays a string.
                StateValue::Number(v)
                    if category == DtypeCategory::String && strategy == Strategy::Constant =>
                {
                    fill_strings(&mut out, series, target, &v.to_string())?
                }
                StateValue::Number(v) => fill_numbers(&mut out, series, target, *v, self.kind())?,
                StateValue::Text(s) if numeric_storage => {
                    let v = parse_numeric_string(s).ok_or_else(|| {
                        WipekitError::schema_mismatch(
                            ctx(),
                            format!("fill value '{s}' cannot fill a numeric column"),
                        )
                    })?;
                    fill_numbers(&mut out, series, target, v, self.kind())?
                }
                StateValue::Text(s) => fill_strings(&mut out, series, target, s)?,
                _ => {
                    return Err(WipekitError::configuration(ctx(), "fill value has wrong type"));
                }
            }
        }
        Ok(out)
    }
}

fn fill_numbers(out: &mut DataFrame, series: &Series, target: &str, fill: f64, kind: &str) -> Result<()> {
    let filled: Vec<Option<f64>> = numeric_values(series, kind)?
        .into_iter()
        .map(|v| Some(v.unwrap_or(fill)))
        .collect();
    put_f64_column(out, target, filled)
}

fn fill_strings(out: &mut DataFrame, series: &Series, target: &str, fill: &str) -> Result<()> {
    let filled: Vec<Option<String>> = string_values(series)?
        .into_iter()
        .map(|v| Some(v.unwrap_or_else(|| fill.to_string())))
        .collect();
    put_str_column(out, target, filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Combine;

    fn fit(df: &DataFrame, config: &StageConfig) -> Result<StageState> {
        let acc = Impute.accumulate(df, config)?;
        Impute.finalize(acc, config)
    }

    fn floats(df: &DataFrame, name: &str) -> Vec<Option<f64>> {
        df.column(name)
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_mean_impute() {
        let df = df!["x" => [Some(1.0), None, Some(3.0)]].unwrap();
        let config = StageConfig::new("impute", ["x"]);
        let state = fit(&df, &config).unwrap();
        let out = Impute.transform(&df, &state, &config, None).unwrap();
        assert_eq!(floats(&out, "x"), vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_median_impute_merged_partitions() {
        let a = df!["x" => [Some(1.0), Some(10.0)]].unwrap();
        let b = df!["x" => [None, Some(2.0), Some(3.0)]].unwrap();
        let config = StageConfig::new("impute", ["x"]).param("strategy", "median");
        let acc = Impute
            .accumulate(&a, &config)
            .unwrap()
            .combine(Impute.accumulate(&b, &config).unwrap());
        let state = Impute.finalize(acc, &config).unwrap();
        assert_eq!(state.number("x.fill").unwrap(), 2.5);
    }

    #[test]
    fn test_mode_impute_strings() {
        let df = df!["c" => [Some("b"), Some("a"), None, Some("b"), Some("a")]].unwrap();
        let config = StageConfig::new("impute", ["c"]).param("strategy", "mode");
        let state = fit(&df, &config).unwrap();
        assert_eq!(state.text("c.fill").unwrap(), "a");
        let out = Impute.transform(&df, &state, &config, None).unwrap();
        assert_eq!(out.column("c").unwrap().null_count(), 0);
    }

    #[test]
    fn test_constant_impute() {
        let df = df!["c" => [Some("x"), None]].unwrap();
        let config = StageConfig::new("impute", ["c"])
            .param("strategy", "constant")
            .param("fill_value", "missing");
        let state = fit(&df, &config).unwrap();
        let out = Impute.transform(&df, &state, &config, None).unwrap();
        let values: Vec<Option<&str>> = out
            .column("c")
            .unwrap()
            .as_materialized_series()
            .str()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(values, vec![Some("x"), Some("missing")]);
    }

    #[test]
    fn test_mean_of_all_null_is_insufficient() {
        let df = df!["x" => [None::<f64>, None]].unwrap();
        let config = StageConfig::new("impute", ["x"]);
        let err = fit(&df, &config).unwrap_err();
        assert!(matches!(err, WipekitError::InsufficientData { .. }));
    }

    #[test]
    fn test_fill_value_requires_constant() {
        let config = StageConfig::new("impute", ["x"]).param("fill_value", 0);
        assert!(Impute.validate_config(&config).is_err());
        let config = StageConfig::new("impute", ["x"]).param("strategy", "constant");
        assert!(Impute.validate_config(&config).is_err());
    }
}
