//! Categorical encodings.
//!
//! Both encoders learn the sorted category list of each target. Values not
//! seen at fit time either fail the transform (`handle_unknown: "error"`,
//! the default) or go to a reserved unknown bucket (`"bucket"`).

use super::{CATEGORICAL, accumulate_categorical, append_columns, target_acc};
use crate::backend::StageAccumulator;
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnSpec, ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue, UNKNOWN_LABEL};
use crate::utils::{
    numeric_values, put_f64_column, put_i64_column, put_str_column, require_column, string_values,
};
use polars::prelude::*;
use std::collections::HashMap;
use tracing::debug;

/// Suffix of the one-hot column that receives unseen categories.
pub const UNKNOWN_SUFFIX: &str = "_unknown";

fn bucket_unknowns(config: &StageConfig) -> Result<bool> {
    Ok(config.choice("handle_unknown", &["error", "bucket"], "error")? == "bucket")
}

fn categories_key(target: &str) -> String {
    column_key(target, "categories")
}

fn learn_categories(acc: &StageAccumulator, config: &StageConfig) -> Result<StageState> {
    let mut state = StageState::empty();
    for target in &config.target_columns {
        let categories = target_acc(acc, config, target)?
            .frequencies
            .as_ref()
            .map(|f| f.categories())
            .unwrap_or_default();
        if categories.is_empty() {
            return Err(WipekitError::insufficient_data(
                config.context().column(target.as_str()),
                "no non-null categories to learn",
            ));
        }
        debug!(column = %target, categories = categories.len(), "learned categories");
        state.insert(categories_key(target), StateValue::Texts(categories));
    }
    Ok(state)
}

fn unseen(config: &StageConfig, target: &str, value: &str) -> WipekitError {
    WipekitError::schema_mismatch(
        config.context().column(target),
        format!("category '{value}' was not seen during fit"),
    )
}

// =============================================================================
// Label encoding
// =============================================================================

/// Replaces each category with its index in the sorted category list.
///
/// With `handle_unknown: "bucket"` unseen values get code `n` (the number of
/// fitted categories), which inverts to [`UNKNOWN_LABEL`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelEncode;

impl Stage for LabelEncode {
    fn kind(&self) -> &'static str {
        "label_encode"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["handle_unknown"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        CATEGORICAL
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        bucket_unknowns(config).map(|_| ())
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
        Ok(Some(super::retype_targets(
            input,
            config,
            ColumnType::Categorical,
            None,
        )))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_categorical(partition, config)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        learn_categories(&acc, config)
    }

    fn transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let bucket = bucket_unknowns(config)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let categories = state.texts(&categories_key(target))?;
            let codes: HashMap<&str, i64> = categories
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str(), i as i64))
                .collect();
            let unknown_code = categories.len() as i64;
            let values = string_values(require_column(partition, target, self.kind())?)?;
            let encoded = values
                .iter()
                .map(|v| match v {
                    None => Ok(None),
                    Some(label) => match codes.get(label.as_str()) {
                        Some(&code) => Ok(Some(code)),
                        None if bucket => Ok(Some(unknown_code)),
                        None => Err(unseen(config, target, label)),
                    },
                })
                .collect::<Result<Vec<_>>>()?;
            put_i64_column(&mut out, target, encoded)?;
        }
        Ok(out)
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
        let bucket = bucket_unknowns(config)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let categories = state.texts(&categories_key(target))?;
            let codes = numeric_values(require_column(partition, target, self.kind())?, self.kind())?;
            let decoded = codes
                .into_iter()
                .map(|code| {
                    let Some(code) = code else { return Ok(None) };
                    let integral = code >= 0.0 && code.fract() == 0.0;
                    let idx = code as usize;
                    if integral && idx < categories.len() {
                        Ok(Some(categories[idx].clone()))
                    } else if integral && bucket && idx == categories.len() {
                        Ok(Some(UNKNOWN_LABEL.to_string()))
                    } else {
                        Err(WipekitError::schema_mismatch(
                            config.context().column(target.as_str()),
                            format!("code {code} is outside the fitted categories"),
                        ))
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            put_str_column(&mut out, target, decoded)?;
        }
        Ok(out)
    }
}

// =============================================================================
// One-hot encoding
// =============================================================================

/// Replaces each target with one 0/1 column per fitted category, named
/// `{column}_{category}`, appended after the existing columns.
///
/// In bucket mode an extra `{column}__unknown` column flags unseen values.
/// Null inputs give null indicators. Inversion is opt-in
/// (`invertible: true`); it takes the first maximal indicator and maps an
/// all-zero row to null.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneHot;

impl OneHot {
    fn indicator_names(target: &str, categories: &[String], bucket: bool) -> Vec<String> {
        let mut names: Vec<String> = categories.iter().map(|c| format!("{target}_{c}")).collect();
        if bucket {
            names.push(format!("{target}_{UNKNOWN_SUFFIX}"));
        }
        names
    }
}

impl Stage for OneHot {
    fn kind(&self) -> &'static str {
        "one_hot"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["handle_unknown"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        CATEGORICAL
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        bucket_unknowns(config).map(|_| ())
    }

    fn supports_inverse(&self, config: &StageConfig) -> bool {
        config.bool_or("invertible", false).unwrap_or(false)
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        let Some(state) = state else {
            return Ok(None);
        };
        let bucket = bucket_unknowns(config)?;
        let mut schema = input.clone();
        for target in &config.target_columns {
            let nullable = input.get(target).is_none_or(|spec| spec.nullable);
            let categories = state.texts(&categories_key(target))?;
            schema = schema.without(target);
            let specs = Self::indicator_names(target, &categories, bucket)
                .into_iter()
                .map(|name| ColumnSpec::new(name, ColumnType::Numeric).nullable(nullable));
            schema = append_columns(schema, config, specs)?;
        }
        Ok(Some(schema))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        accumulate_categorical(partition, config)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        learn_categories(&acc, config)
    }

    fn transform(
        &self,
        partition: &DataFrame,
        state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let bucket = bucket_unknowns(config)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let categories = state.texts(&categories_key(target))?;
            let positions: HashMap<&str, usize> = categories
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str(), i))
                .collect();
            let names = Self::indicator_names(target, &categories, bucket);
            let values = string_values(require_column(partition, target, self.kind())?)?;

            let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(values.len()); names.len()];
            for value in &values {
                let hot = match value {
                    None => None,
                    Some(label) => match positions.get(label.as_str()) {
                        Some(&pos) => Some(pos),
                        None if bucket => Some(categories.len()),
                        None => return Err(unseen(config, target, label)),
                    },
                };
                for (i, column) in columns.iter_mut().enumerate() {
                    column.push(hot.map(|h| if h == i { 1.0 } else { 0.0 }));
                }
            }

            out = out.drop(target)?;
            for (name, column) in names.iter().zip(columns) {
                if out.get_column_index(name).is_some() {
                    return Err(crate::stage::output_collision(config, name));
                }
                put_f64_column(&mut out, name, column)?;
            }
        }
        Ok(out)
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
        let bucket = bucket_unknowns(config)?;
        let mut out = partition.clone();
        for target in &config.target_columns {
            let categories = state.texts(&categories_key(target))?;
            let names = Self::indicator_names(target, &categories, bucket);
            let indicators = names
                .iter()
                .map(|name| numeric_values(require_column(partition, name, self.kind())?, self.kind()))
                .collect::<Result<Vec<_>>>()?;

            let decoded: Vec<Option<String>> = (0..partition.height())
                .map(|row| {
                    let mut best: Option<(usize, f64)> = None;
                    for (i, column) in indicators.iter().enumerate() {
                        if let Some(v) = column[row]
                            && best.is_none_or(|(_, b)| v > b)
                        {
                            best = Some((i, v));
                        }
                    }
                    match best {
                        Some((i, v)) if v > 0.0 => Some(
                            categories
                                .get(i)
                                .cloned()
                                .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
                        ),
                        _ => None,
                    }
                })
                .collect();

            for name in &names {
                out = out.drop(name)?;
            }
            put_str_column(&mut out, target, decoded)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(stage: &dyn Stage, df: &DataFrame, config: &StageConfig) -> StageState {
        let acc = stage.accumulate(df, config).unwrap();
        stage.finalize(acc, config).unwrap()
    }

    fn strings(df: &DataFrame, name: &str) -> Vec<Option<String>> {
        string_values(df.column(name).unwrap().as_materialized_series()).unwrap()
    }

    fn colors() -> DataFrame {
        df!["color" => [Some("red"), Some("blue"), None, Some("green"), Some("red")]].unwrap()
    }

    #[test]
    fn test_label_encode_sorted_codes() {
        let df = colors();
        let config = StageConfig::new("label_encode", ["color"]);
        let state = fit(&LabelEncode, &df, &config);
        assert_eq!(
            state.texts("color.categories").unwrap(),
            vec!["blue", "green", "red"]
        );
        let out = LabelEncode.transform(&df, &state, &config, None).unwrap();
        let codes: Vec<Option<i64>> = out
            .column("color")
            .unwrap()
            .as_materialized_series()
            .i64()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(codes, vec![Some(2), Some(0), None, Some(1), Some(2)]);

        let back = LabelEncode.inverse_transform(&out, &state, &config).unwrap();
        assert_eq!(strings(&back, "color"), strings(&df, "color"));
    }

    #[test]
    fn test_label_encode_unseen_value() {
        let config = StageConfig::new("label_encode", ["color"]);
        let state = fit(&LabelEncode, &colors(), &config);
        let fresh = df!["color" => ["purple"]].unwrap();
        let err = LabelEncode.transform(&fresh, &state, &config, None).unwrap_err();
        assert!(matches!(err, WipekitError::SchemaMismatch { .. }));

        let config = config.param("handle_unknown", "bucket");
        let out = LabelEncode.transform(&fresh, &state, &config, None).unwrap();
        let back = LabelEncode.inverse_transform(&out, &state, &config).unwrap();
        assert_eq!(strings(&back, "color"), vec![Some(UNKNOWN_LABEL.to_string())]);
    }

    #[test]
    fn test_label_decode_rejects_fractional_codes() {
        let config = StageConfig::new("label_encode", ["color"]).param("handle_unknown", "bucket");
        let state = fit(&LabelEncode, &colors(), &config);
        for code in [1.5, 3.5, -1.0] {
            let codes = df!["color" => [code]].unwrap();
            let err = LabelEncode.inverse_transform(&codes, &state, &config).unwrap_err();
            assert!(matches!(err, WipekitError::SchemaMismatch { .. }), "code {code}");
        }
        let bucket = df!["color" => [3.0]].unwrap();
        let back = LabelEncode.inverse_transform(&bucket, &state, &config).unwrap();
        assert_eq!(strings(&back, "color"), vec![Some(UNKNOWN_LABEL.to_string())]);
    }

    #[test]
    fn test_one_hot_columns() {
        let df = colors();
        let config = StageConfig::new("one_hot", ["color"]);
        let state = fit(&OneHot, &df, &config);
        let out = OneHot.transform(&df, &state, &config, None).unwrap();
        assert!(out.column("color").is_err());
        let red: Vec<Option<f64>> = out
            .column("color_red")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(red, vec![Some(1.0), Some(0.0), None, Some(0.0), Some(1.0)]);
    }

    #[test]
    fn test_one_hot_schema_needs_state() {
        let schema = Schema::builder()
            .column("color", ColumnType::Categorical)
            .build()
            .unwrap();
        let config = StageConfig::new("one_hot", ["color"]).param("handle_unknown", "bucket");
        assert!(OneHot.output_schema(&schema, &config, None).unwrap().is_none());

        let state = fit(&OneHot, &colors(), &config);
        let out = OneHot
            .output_schema(&schema, &config, Some(&state))
            .unwrap()
            .unwrap();
        assert_eq!(
            out.names(),
            vec!["color_blue", "color_green", "color_red", "color__unknown"]
        );
    }

    #[test]
    fn test_one_hot_inverse_is_opt_in() {
        let df = colors();
        let config = StageConfig::new("one_hot", ["color"]);
        let state = fit(&OneHot, &df, &config);
        let out = OneHot.transform(&df, &state, &config, None).unwrap();
        let err = OneHot.inverse_transform(&out, &state, &config).unwrap_err();
        assert!(matches!(err, WipekitError::Capability { .. }));

        let config = config.param("invertible", true);
        let back = OneHot.inverse_transform(&out, &state, &config).unwrap();
        assert_eq!(strings(&back, "color"), strings(&df, "color"));
    }
}
