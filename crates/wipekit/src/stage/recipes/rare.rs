//! Rare-category grouping (k-anonymity style generalization).

use super::{CATEGORICAL, accumulate_categorical, target_acc};
use crate::backend::StageAccumulator;
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue};
use crate::utils::{put_str_column, require_column, string_values};
use polars::prelude::*;
use std::collections::HashSet;
use tracing::debug;

/// Categories seen fewer than `k` times at fit time are rare.
///
/// `strategy: "generalization"` (default) replaces rare values with
/// `other_label` (default `"Other"`); `"suppression"` nulls them. Values
/// never seen during fit count as rare.
#[derive(Debug, Clone, Copy, Default)]
pub struct RareCategory;

impl RareCategory {
    fn k(config: &StageConfig) -> Result<u64> {
        let k = config.usize_or("k", 2)?;
        if k < 2 {
            return Err(WipekitError::configuration(
                config.context(),
                format!("k must be at least 2, got {k}"),
            ));
        }
        Ok(k as u64)
    }

    fn suppress(config: &StageConfig) -> Result<bool> {
        Ok(config.choice("strategy", &["generalization", "suppression"], "generalization")?
            == "suppression")
    }
}

impl Stage for RareCategory {
    fn kind(&self) -> &'static str {
        "rare_category"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["k", "strategy", "other_label"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        CATEGORICAL
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        Self::k(config)?;
        Self::suppress(config)?;
        config.get_str("other_label")?;
        Ok(())
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        let suppress = Self::suppress(config)?;
        let mut out = input.clone();
        for target in &config.target_columns {
            if let Some(spec) = input.get(target)
                && suppress
            {
                out = out.upsert(spec.clone().nullable(true));
            }
        }
        Ok(Some(out))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_categorical(partition, config)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let k = Self::k(config)?;
        let mut state = StageState::empty();
        for target in &config.target_columns {
            let kept: Vec<String> = target_acc(&acc, config, target)?
                .frequencies
                .as_ref()
                .map(|f| {
                    f.counts
                        .iter()
                        .filter(|&(_, &count)| count >= k)
                        .map(|(label, _)| label.clone())
                        .collect()
                })
                .unwrap_or_default();
            debug!(column = %target, kept = kept.len(), "frequent categories");
            state.insert(column_key(target, "kept"), StateValue::Texts(kept));
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
        let suppress = Self::suppress(config)?;
        let other = config.str_or("other_label", "Other")?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let kept_list = state.texts(&column_key(target, "kept"))?;
            let kept: HashSet<&str> = kept_list.iter().map(String::as_str).collect();
            let values = string_values(require_column(partition, target, self.kind())?)?;
            let grouped: Vec<Option<String>> = values
                .into_iter()
                .map(|v| match v {
                    Some(label) if kept.contains(label.as_str()) => Some(label),
                    Some(_) if suppress => None,
                    Some(_) => Some(other.to_string()),
                    None => None,
                })
                .collect();
            put_str_column(&mut out, target, grouped)?;
        }
        Ok(out)
    }
}
