//! Quantile binning.

use super::{NUMERIC, accumulate_numeric, sketch_accuracy, target_acc};
use crate::backend::StageAccumulator;
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue};
use crate::utils::{numeric_values, put_i64_column, require_column};
use polars::prelude::*;
use tracing::{debug, warn};

/// Replaces values with the index of their quantile bin.
///
/// Interior edges sit at the `i / n_bins` quantiles; duplicate edges collapse,
/// so a skewed column may get fewer bins. Bins are closed on the right.
/// Above the exact-value limit the edges come from a sketch with relative
/// accuracy `sketch_accuracy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantileBin;

impl QuantileBin {
    fn n_bins(config: &StageConfig) -> Result<usize> {
        let n = config.usize_or("n_bins", 4)?;
        if n < 2 {
            return Err(WipekitError::configuration(
                config.context(),
                format!("n_bins must be at least 2, got {n}"),
            ));
        }
        Ok(n)
    }
}

impl Stage for QuantileBin {
    fn kind(&self) -> &'static str {
        "quantile_bin"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["n_bins", "sketch_accuracy"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        Self::n_bins(config)?;
        sketch_accuracy(config)?;
        Ok(())
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        Ok(Some(super::retype_targets(
            input,
            config,
            ColumnType::Categorical,
            None,
        )))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_numeric(partition, config, Some(sketch_accuracy(config)?))
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let n = Self::n_bins(config)?;
        let mut state = StageState::empty();
        for target in &config.target_columns {
            let sketch = target_acc(&acc, config, target)?
                .sketch
                .as_ref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    WipekitError::insufficient_data(
                        config.context().column(target.as_str()),
                        "quantiles of zero non-null values",
                    )
                })?;
            let edges = sketch.interior_quantiles(n);
            if edges.len() + 1 < n {
                warn!(column = %target, requested = n, bins = edges.len() + 1, "duplicate quantile edges collapsed");
            }
            debug!(column = %target, ?edges, "bin edges");
            state.insert(column_key(target, "edges"), StateValue::Numbers(edges));
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
        let mut out = partition.clone();
        for target in &config.target_columns {
            let edges = state.numbers(&column_key(target, "edges"))?;
            let values = numeric_values(require_column(partition, target, self.kind())?, self.kind())?;
            let bins: Vec<Option<i64>> = values
                .into_iter()
                .map(|v| v.map(|x| edges.partition_point(|&e| e < x) as i64))
                .collect();
            put_i64_column(&mut out, target, bins)?;
        }
        Ok(out)
    }
}
