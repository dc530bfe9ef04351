//! Row-wise string cleanup.

use super::CATEGORICAL;
use crate::error::Result;
use crate::schema::{ColumnType, Schema};
use crate::stage::{Stage, StageCategory, StageConfig, StageState};
use crate::utils::{put_str_column, require_column};
use polars::prelude::*;

/// Trims surrounding whitespace, optionally lowercasing. Stateless.
///
/// Non-string physical columns pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimWhitespace;

impl Stage for TrimWhitespace {
    fn kind(&self) -> &'static str {
        "trim_whitespace"
    }

    fn category(&self) -> StageCategory {
        StageCategory::RowWise
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["lowercase"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        CATEGORICAL
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        config.get_bool("lowercase")?;
        Ok(())
    }

    fn output_schema(
        &self,
        input: &Schema,
        _config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        Ok(Some(input.clone()))
    }

    fn transform(
        &self,
        partition: &DataFrame,
        _state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let lowercase = config.bool_or("lowercase", false)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let series = require_column(partition, target, self.kind())?;
            if !matches!(series.dtype(), DataType::String) {
                continue;
            }
            let cleaned: Vec<Option<String>> = series
                .str()?
                .into_iter()
                .map(|v| {
                    v.map(|s| {
                        let trimmed = s.trim();
                        if lowercase {
                            trimmed.to_lowercase()
                        } else {
                            trimmed.to_string()
                        }
                    })
                })
                .collect();
            put_str_column(&mut out, target, cleaned)?;
        }
        Ok(out)
    }
}
