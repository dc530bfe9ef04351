//! Stages: stateful, composable column transformations.
//!
//! A stage kind implements [`Stage`]. Fitting is split into a per-partition
//! [`Stage::accumulate`] that returns a combinable [`StageAccumulator`] and a
//! [`Stage::finalize`] that turns the merged accumulator into an immutable
//! [`StageState`]. Transforms are pure functions of a partition, the state,
//! the config and (for window stages) the preceding rows.

pub mod config;
pub mod recipes;
pub mod registry;
pub mod state;

pub use config::StageConfig;
pub use registry::StageRegistry;
pub use state::{StageState, StateValue};

use crate::backend::{MapPlan, StageAccumulator};
use crate::error::{ErrorContext, Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Debug;

/// Hyperparameters every stage understands.
pub const COMMON_HYPERPARAMETERS: [&str; 2] = ["allow_unknown", "invertible"];

/// Sentinel label produced when inverting an unknown-bucket code.
pub const UNKNOWN_LABEL: &str = "__unknown__";

/// How a stage looks at its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    /// Each row is transformed on its own.
    RowWise,
    /// Needs statistics over the whole column.
    ColumnarStatistic,
    /// Needs preceding rows in ordering-key order.
    Window,
    /// Combines several columns of the same row.
    CrossFeature,
}

/// One kind of transformation.
///
/// Implementations hold no per-fit data; everything learned lives in the
/// returned [`StageState`], so one instance serves every pipeline.
pub trait Stage: Send + Sync + Debug {
    fn kind(&self) -> &'static str;

    fn category(&self) -> StageCategory;

    /// Kind-specific hyperparameters, on top of [`COMMON_HYPERPARAMETERS`].
    fn allowed_hyperparameters(&self) -> &'static [&'static str];

    /// Logical types a target column may have under `config`.
    fn accepted_types(&self, config: &StageConfig) -> &'static [ColumnType];

    /// Checks on hyperparameter values. Unknown keys, empty targets and the
    /// `invertible` flag are checked by [`check_config`].
    fn validate_config(&self, _config: &StageConfig) -> Result<()> {
        Ok(())
    }

    fn supports_inverse(&self, _config: &StageConfig) -> bool {
        false
    }

    /// Preceding rows a window stage needs.
    fn lookback(&self, _config: &StageConfig) -> Result<usize> {
        Ok(0)
    }

    /// Ordering key column of a window stage.
    fn order_by(&self, _config: &StageConfig) -> Result<Option<String>> {
        Ok(None)
    }

    /// Schema produced from `input`. `Ok(None)` when the output depends on
    /// fitted state that is not yet available.
    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        state: Option<&StageState>,
    ) -> Result<Option<Schema>>;

    fn accumulate(&self, _partition: &DataFrame, _config: &StageConfig) -> Result<StageAccumulator> {
        Ok(StageAccumulator::default())
    }

    fn finalize(&self, _acc: StageAccumulator, _config: &StageConfig) -> Result<StageState> {
        Ok(StageState::empty())
    }

    fn transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
        context: Option<&DataFrame>,
    ) -> Result<DataFrame>;

    fn inverse_transform(
        &self,
        _partition: &DataFrame,
        _state: &StageState,
        config: &StageConfig,
    ) -> Result<DataFrame> {
        Err(WipekitError::capability(config.context(), "inverse_transform"))
    }
}

/// Config checks that need no schema: kind, targets, hyperparameter names,
/// invertibility and kind-specific values.
pub fn check_config(stage: &dyn Stage, config: &StageConfig) -> Result<()> {
    let ctx = || config.context();
    if config.kind != stage.kind() {
        return Err(WipekitError::configuration(
            ctx(),
            format!("config for '{}' given to stage '{}'", config.kind, stage.kind()),
        ));
    }
    if config.target_columns.is_empty() {
        return Err(WipekitError::configuration(ctx(), "no target columns"));
    }
    let mut seen = HashSet::new();
    for target in &config.target_columns {
        if !seen.insert(target.as_str()) {
            return Err(WipekitError::configuration(
                ctx().column(target.as_str()),
                "target column listed twice",
            ));
        }
    }
    for key in config.hyperparameters.keys() {
        let known = COMMON_HYPERPARAMETERS.contains(&key.as_str())
            || stage.allowed_hyperparameters().contains(&key.as_str());
        if !known {
            return Err(WipekitError::configuration(
                ctx(),
                format!("unknown hyperparameter '{key}'"),
            ));
        }
    }
    config.get_bool("allow_unknown")?;
    if config.get_bool("invertible")? == Some(true) && !stage.supports_inverse(config) {
        return Err(WipekitError::configuration(
            ctx(),
            "this stage cannot be inverted; remove 'invertible: true'",
        ));
    }
    stage.validate_config(config)
}

/// Check every target against `schema`: present, and of an accepted type.
pub fn check_targets(stage: &dyn Stage, config: &StageConfig, schema: &Schema) -> Result<()> {
    let accepted = stage.accepted_types(config);
    let allow_unknown = config.bool_or("allow_unknown", false)?;
    for target in &config.target_columns {
        let ctx = config.context().column(target.as_str());
        let spec = schema.get(target).ok_or_else(|| {
            WipekitError::schema_mismatch(ctx.clone(), "target column is not in the schema")
        })?;
        if spec.dtype == ColumnType::Unknown {
            if allow_unknown {
                continue;
            }
            return Err(WipekitError::configuration(
                ctx,
                "target has unknown type; set 'allow_unknown: true' to use it",
            ));
        }
        if !accepted.contains(&spec.dtype) {
            return Err(WipekitError::schema_mismatch(
                ctx,
                format!(
                    "type {} is not accepted (expected one of: {})",
                    spec.dtype,
                    accepted
                        .iter()
                        .map(ColumnType::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }
    }
    if let Some(key) = stage.order_by(config)?
        && !schema.contains(&key)
    {
        return Err(WipekitError::schema_mismatch(
            config.context().column(key),
            "ordering key is not in the schema",
        ));
    }
    Ok(())
}

/// How the backend should feed this stage's transform.
pub fn map_plan(stage: &dyn Stage, config: &StageConfig) -> Result<MapPlan> {
    match stage.order_by(config)? {
        Some(key) => Ok(MapPlan::window(stage.kind(), key, stage.lookback(config)?)),
        None => Ok(MapPlan::independent(stage.kind())),
    }
}

/// Error for an output column that would overwrite an existing one.
pub(crate) fn output_collision(config: &StageConfig, name: &str) -> WipekitError {
    WipekitError::configuration(
        ErrorContext::new().stage(config.kind.as_str()).column(name),
        "output column already exists",
    )
}
