//! Bundled stage kinds.
//!
//! | kind              | category           | invertible |
//! |-------------------|--------------------|------------|
//! | `trim_whitespace` | row-wise           | no |
//! | `impute`          | columnar statistic | no |
//! | `standard_scale`  | columnar statistic | yes (default) |
//! | `minmax_scale`    | columnar statistic | yes (default) |
//! | `label_encode`    | columnar statistic | yes (default) |
//! | `one_hot`         | columnar statistic | opt-in |
//! | `quantile_bin`    | columnar statistic | no |
//! | `rare_category`   | columnar statistic | no |
//! | `k_anonymity`     | columnar statistic | no |
//! | `lag`             | window             | no |
//! | `rolling_mean`    | window             | no |
//! | `polynomial`      | cross-feature      | no |

mod anonymity;
mod binning;
mod cross;
mod encoding;
mod imputation;
mod rare;
mod rowwise;
mod scaling;
mod window;

pub use anonymity::KAnonymity;
pub use binning::QuantileBin;
pub use cross::Polynomial;
pub use encoding::{LabelEncode, OneHot};
pub use imputation::Impute;
pub use rare::RareCategory;
pub use rowwise::TrimWhitespace;
pub use scaling::{MinMaxScale, StandardScale};
pub use window::{Lag, RollingMean};

use super::{Stage, StageConfig};
use crate::backend::accumulators::DEFAULT_SKETCH_ACCURACY;
use crate::backend::{ColumnAccumulator, StageAccumulator};
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnSpec, ColumnType, Schema};
use crate::utils::{numeric_values, require_column, string_values};
use polars::prelude::DataFrame;
use std::sync::Arc;

pub(crate) const NUMERIC: &[ColumnType] = &[ColumnType::Numeric];
pub(crate) const CATEGORICAL: &[ColumnType] = &[ColumnType::Categorical, ColumnType::Text];

/// Every bundled stage, one instance each.
pub fn bundled() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(TrimWhitespace),
        Arc::new(Impute),
        Arc::new(StandardScale),
        Arc::new(MinMaxScale),
        Arc::new(LabelEncode),
        Arc::new(OneHot),
        Arc::new(QuantileBin),
        Arc::new(RareCategory),
        Arc::new(KAnonymity),
        Arc::new(Lag),
        Arc::new(RollingMean),
        Arc::new(Polynomial),
    ]
}

/// Copy of `input` with every target retyped.
pub(crate) fn retype_targets(
    input: &Schema,
    config: &StageConfig,
    dtype: ColumnType,
    nullable: Option<bool>,
) -> Schema {
    let mut out = input.clone();
    for target in &config.target_columns {
        if let Some(spec) = input.get(target) {
            let mut next = spec.clone();
            next.dtype = dtype;
            if let Some(nullable) = nullable {
                next.nullable = nullable;
            }
            out = out.upsert(next);
        }
    }
    out
}

/// Append derived columns, rejecting names that already exist.
pub(crate) fn append_columns(
    mut schema: Schema,
    config: &StageConfig,
    columns: impl IntoIterator<Item = ColumnSpec>,
) -> Result<Schema> {
    for spec in columns {
        if schema.contains(&spec.name) {
            return Err(super::output_collision(config, &spec.name));
        }
        schema = schema.upsert(spec);
    }
    Ok(schema)
}

/// Relative accuracy of the quantile sketch a stage fits with.
///
/// Read from the `sketch_accuracy` hyperparameter, defaulting to
/// [`DEFAULT_SKETCH_ACCURACY`]. It only matters once a column holds more than
/// [`EXACT_VALUE_LIMIT`](crate::backend::accumulators::EXACT_VALUE_LIMIT) values; below that quantiles are exact. Stage
/// sketches are independent of the drift monitor's `sketch_accuracy`.
pub(crate) fn sketch_accuracy(config: &StageConfig) -> Result<f64> {
    let accuracy = config.f64_or("sketch_accuracy", DEFAULT_SKETCH_ACCURACY)?;
    if !(accuracy > 0.0 && accuracy < 1.0) {
        return Err(WipekitError::configuration(
            config.context(),
            format!("sketch_accuracy must be in (0, 1), got {accuracy}"),
        ));
    }
    Ok(accuracy)
}

/// Moments for every target, plus a quantile sketch of the given accuracy.
pub(crate) fn accumulate_numeric(
    partition: &DataFrame,
    config: &StageConfig,
    sketch: Option<f64>,
) -> Result<StageAccumulator> {
    let mut acc = StageAccumulator::new();
    for target in &config.target_columns {
        let values = numeric_values(require_column(partition, target, &config.kind)?, &config.kind)?;
        let column = match sketch {
            Some(accuracy) => ColumnAccumulator::numeric_with_sketch(&values, accuracy),
            None => ColumnAccumulator::numeric(&values),
        };
        acc.insert(target.as_str(), column);
    }
    Ok(acc)
}

/// Category frequencies for every target.
pub(crate) fn accumulate_categorical(
    partition: &DataFrame,
    config: &StageConfig,
) -> Result<StageAccumulator> {
    let mut acc = StageAccumulator::new();
    for target in &config.target_columns {
        let values = string_values(require_column(partition, target, &config.kind)?)?;
        acc.insert(target.as_str(), ColumnAccumulator::categorical(&values));
    }
    Ok(acc)
}

/// Merged accumulator of one target; absent when the dataset had no
/// partitions.
pub(crate) fn target_acc<'a>(
    acc: &'a StageAccumulator,
    config: &StageConfig,
    target: &str,
) -> Result<&'a ColumnAccumulator> {
    acc.column(target).ok_or_else(|| {
        WipekitError::insufficient_data(
            config.context().column(target),
            "no rows were seen for this column",
        )
    })
}
