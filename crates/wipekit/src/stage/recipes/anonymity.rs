//! K-anonymity over several quasi-identifier columns.
//!
//! Each quasi-identifier is generalized on its own: numeric columns into
//! quantile ranges (`binning`) or into means of sorted groups of at least `k`
//! values (`microaggregation`), categorical columns by grouping or nulling
//! values seen fewer than `k` times. With `verify` (the default) the
//! combinations of generalized values are then counted, and rows whose
//! combination occurred fewer than `k` times at fit time are suppressed.
//!
//! Fitting collects exact counts of raw quasi-identifier tuples, so the
//! fitted state does not depend on how the input was partitioned.

use super::target_acc;
use crate::backend::{ColumnAccumulator, Frequencies, StageAccumulator};
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnType, Schema};
use crate::stage::state::column_key;
use crate::stage::{Stage, StageCategory, StageConfig, StageState, StateValue};
use crate::utils::{
    DtypeCategory, get_dtype_category, numeric_values, put_f64_column, put_str_column,
    require_column, string_values, take_rows,
};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

const QUASI_IDENTIFIER: &[ColumnType] =
    &[ColumnType::Numeric, ColumnType::Categorical, ColumnType::Text];

/// Accumulator slot holding the raw tuple counts. Not a valid column key
/// because it starts with a control character.
const TUPLES: &str = "\u{1f}tuples";

/// State key of the combinations that met `k` at fit time.
const COMBINATIONS: &str = "combinations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Binning,
    Microaggregation,
    Generalization,
    Suppression,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Binning => "binning",
            Self::Microaggregation => "microaggregation",
            Self::Generalization => "generalization",
            Self::Suppression => "suppression",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "binning" => Some(Self::Binning),
            "microaggregation" => Some(Self::Microaggregation),
            "generalization" => Some(Self::Generalization),
            "suppression" => Some(Self::Suppression),
            _ => None,
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, Self::Binning | Self::Microaggregation)
    }
}

/// Suppresses quasi-identifier combinations shared by fewer than `k` rows.
///
/// Hyperparameters: `k` (default 2, at least 2), `numerical_method`
/// (`binning` or `microaggregation`), `bin_count` (default 5),
/// `categorical_method` (`generalization` or `suppression`), `other_label`
/// (default `"Other"`), `verify` (default true) and `record_suppression`
/// (`null` blanks every quasi-identifier of a violating row, `drop` removes
/// the row). Combinations never seen during fit count as violating.
#[derive(Debug, Clone, Copy, Default)]
pub struct KAnonymity;

impl KAnonymity {
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

    fn bin_count(config: &StageConfig) -> Result<usize> {
        let n = config.usize_or("bin_count", 5)?;
        if n < 2 {
            return Err(WipekitError::configuration(
                config.context(),
                format!("bin_count must be at least 2, got {n}"),
            ));
        }
        Ok(n)
    }

    fn numerical_method(config: &StageConfig) -> Result<Method> {
        let name = config.choice("numerical_method", &["binning", "microaggregation"], "binning")?;
        Ok(Method::parse(name).unwrap_or(Method::Binning))
    }

    fn categorical_method(config: &StageConfig) -> Result<Method> {
        let name = config.choice(
            "categorical_method",
            &["generalization", "suppression"],
            "generalization",
        )?;
        Ok(Method::parse(name).unwrap_or(Method::Generalization))
    }

    fn drops_records(config: &StageConfig) -> Result<bool> {
        Ok(config.choice("record_suppression", &["null", "drop"], "null")? == "drop")
    }

    /// Method a target ends up with: from the fitted state when there is
    /// one, otherwise from its declared type.
    fn method_for(
        config: &StageConfig,
        target: &str,
        dtype: ColumnType,
        state: Option<&StageState>,
    ) -> Result<Method> {
        if let Some(state) = state {
            let name = state.text(&column_key(target, "method"))?;
            return Method::parse(&name).ok_or_else(|| {
                WipekitError::configuration(
                    config.context().column(target),
                    format!("unknown method '{name}' in fitted state"),
                )
            });
        }
        if dtype == ColumnType::Numeric {
            Self::numerical_method(config)
        } else {
            Self::categorical_method(config)
        }
    }
}

// =============================================================================
// Generalization
// =============================================================================

/// A generalized quasi-identifier value.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Label(String),
    Mean(f64),
}

impl Cell {
    fn key(&self) -> String {
        match self {
            Self::Label(label) => label.clone(),
            Self::Mean(mean) => mean.to_string(),
        }
    }
}

/// Fitted generalization of one column.
#[derive(Debug)]
enum Generalizer {
    /// Sorted, deduplicated quantile edges including min and max.
    Bins(Vec<f64>),
    /// Sorted upper bounds of each group with the group means.
    Groups { bounds: Vec<f64>, means: Vec<f64> },
    /// Frequent labels; rare ones become `replacement` (null when `None`).
    Categories {
        kept: HashSet<String>,
        replacement: Option<String>,
    },
}

impl Generalizer {
    fn from_state(state: &StageState, config: &StageConfig, target: &str) -> Result<Self> {
        let method = KAnonymity::method_for(config, target, ColumnType::Unknown, Some(state))?;
        Ok(match method {
            Method::Binning => Self::Bins(state.numbers(&column_key(target, "edges"))?),
            Method::Microaggregation => Self::Groups {
                bounds: state.numbers(&column_key(target, "bounds"))?,
                means: state.numbers(&column_key(target, "means"))?,
            },
            Method::Generalization | Method::Suppression => Self::Categories {
                kept: state
                    .texts(&column_key(target, "kept"))?
                    .into_iter()
                    .collect(),
                replacement: (method == Method::Generalization)
                    .then(|| config.str_or("other_label", "Other").map(str::to_string))
                    .transpose()?,
            },
        })
    }

    fn apply(&self, raw: Option<&str>) -> Option<Cell> {
        let raw = raw?;
        match self {
            Self::Bins(edges) => {
                let x = raw.parse::<f64>().ok()?;
                let (lo, hi) = match edges.len() {
                    0 => return None,
                    1 => (edges[0], edges[0]),
                    n => {
                        let idx = edges[1..n - 1].partition_point(|&e| e < x);
                        (edges[idx], edges[idx + 1])
                    }
                };
                Some(Cell::Label(format!("{lo:.2}-{hi:.2}")))
            }
            Self::Groups { bounds, means } => {
                let x = raw.parse::<f64>().ok()?;
                let idx = bounds.partition_point(|&b| b < x).min(means.len().checked_sub(1)?);
                Some(Cell::Mean(means[idx]))
            }
            Self::Categories { kept, replacement } => {
                if kept.contains(raw) {
                    Some(Cell::Label(raw.to_string()))
                } else {
                    replacement.clone().map(Cell::Label)
                }
            }
        }
    }
}

/// Raw values of one quasi-identifier as strings; numbers use their
/// shortest round-trip form so they parse back to the same `f64`.
fn raw_values(series: &Series, numeric: bool, stage: &str) -> Result<Vec<Option<String>>> {
    if numeric {
        Ok(numeric_values(series, stage)?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()).map(|x| x.to_string()))
            .collect())
    } else {
        string_values(series)
    }
}

fn is_numeric_column(series: &Series) -> bool {
    get_dtype_category(series.dtype()) == DtypeCategory::Numeric
}

fn tuple_key(cells: &[Option<String>]) -> Result<String> {
    Ok(serde_json::to_string(cells)?)
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn bin_edges(sorted: &[f64], n: usize) -> Vec<f64> {
    let mut edges: Vec<f64> = (0..=n).map(|i| quantile(sorted, i as f64 / n as f64)).collect();
    edges.dedup();
    edges
}

/// Consecutive groups of `k` sorted values; a short tail joins the group
/// before it.
fn micro_groups(sorted: &[f64], k: usize) -> (Vec<f64>, Vec<f64>) {
    let mut groups: Vec<&[f64]> = sorted.chunks(k).collect();
    if groups.len() > 1 && groups.last().is_some_and(|g| g.len() < k) {
        let tail = groups.len() - 2;
        let start = tail * k;
        groups.truncate(tail);
        groups.push(&sorted[start..]);
    }
    let bounds = groups.iter().filter_map(|g| g.last().copied()).collect();
    let means = groups
        .iter()
        .map(|g| g.iter().sum::<f64>() / g.len() as f64)
        .collect();
    (bounds, means)
}

impl Stage for KAnonymity {
    fn kind(&self) -> &'static str {
        "k_anonymity"
    }

    fn category(&self) -> StageCategory {
        StageCategory::ColumnarStatistic
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &[
            "k",
            "numerical_method",
            "bin_count",
            "categorical_method",
            "other_label",
            "verify",
            "record_suppression",
        ]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        QUASI_IDENTIFIER
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        Self::k(config)?;
        Self::bin_count(config)?;
        Self::numerical_method(config)?;
        Self::categorical_method(config)?;
        Self::drops_records(config)?;
        config.get_bool("verify")?;
        config.get_str("other_label")?;
        Ok(())
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        let blanks_records = config.bool_or("verify", true)? && !Self::drops_records(config)?;
        let mut out = input.clone();
        for target in &config.target_columns {
            let Some(spec) = input.get(target) else {
                continue;
            };
            let method = Self::method_for(config, target, spec.dtype, state)?;
            let mut next = spec.clone();
            next.dtype = match method {
                Method::Binning => ColumnType::Categorical,
                Method::Microaggregation => ColumnType::Numeric,
                _ if spec.dtype == ColumnType::Numeric => ColumnType::Categorical,
                _ => spec.dtype,
            };
            next.nullable = spec.nullable || blanks_records || method == Method::Suppression;
            out = out.upsert(next);
        }
        Ok(Some(out))
    }

    fn accumulate(&self, partition: &DataFrame, config: &StageConfig) -> Result<StageAccumulator> {
        let mut acc = StageAccumulator::new();
        let mut columns = Vec::with_capacity(config.target_columns.len());
        for target in &config.target_columns {
            let series = require_column(partition, target, &config.kind)?;
            let numeric = is_numeric_column(series);
            let column = if numeric {
                ColumnAccumulator::numeric(&numeric_values(series, &config.kind)?)
            } else {
                ColumnAccumulator {
                    rows: series.len() as u64,
                    ..Default::default()
                }
            };
            acc.insert(target.as_str(), column);
            columns.push(raw_values(series, numeric, &config.kind)?);
        }

        let mut tuples = Frequencies::default();
        for row in 0..partition.height() {
            let cells: Vec<Option<String>> = columns.iter().map(|c| c[row].clone()).collect();
            tuples.observe(Some(tuple_key(&cells)?.as_str()));
        }
        acc.insert(
            TUPLES,
            ColumnAccumulator {
                rows: partition.height() as u64,
                frequencies: Some(tuples),
                ..Default::default()
            },
        );
        Ok(acc)
    }

    fn finalize(&self, acc: StageAccumulator, config: &StageConfig) -> Result<StageState> {
        let k = Self::k(config)?;
        let targets = &config.target_columns;
        let tuples: Vec<(Vec<Option<String>>, u64)> = acc
            .column(TUPLES)
            .and_then(|c| c.frequencies.as_ref())
            .map(|f| {
                f.counts
                    .iter()
                    .map(|(key, &count)| -> Result<(Vec<Option<String>>, u64)> {
                        Ok((serde_json::from_str(key)?, count))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mut state = StageState::empty();
        for (i, target) in targets.iter().enumerate() {
            let numeric = target_acc(&acc, config, target)?.moments.is_some();
            let method = if numeric {
                Self::numerical_method(config)?
            } else {
                Self::categorical_method(config)?
            };
            state.insert(
                column_key(target, "method"),
                StateValue::Text(method.as_str().to_string()),
            );

            if method.is_numeric() {
                let mut values: Vec<f64> = Vec::new();
                for (cells, count) in &tuples {
                    if let Some(x) = cells[i].as_deref().and_then(|r| r.parse::<f64>().ok()) {
                        values.extend(std::iter::repeat_n(x, *count as usize));
                    }
                }
                if values.is_empty() {
                    return Err(WipekitError::insufficient_data(
                        config.context().column(target.as_str()),
                        "no non-null values to generalize",
                    ));
                }
                values.sort_by(f64::total_cmp);
                if method == Method::Binning {
                    let edges = bin_edges(&values, Self::bin_count(config)?);
                    debug!(column = %target, ?edges, "quasi-identifier bins");
                    state.insert(column_key(target, "edges"), StateValue::Numbers(edges));
                } else {
                    let (bounds, means) = micro_groups(&values, k as usize);
                    debug!(column = %target, groups = means.len(), "quasi-identifier groups");
                    state.insert(column_key(target, "bounds"), StateValue::Numbers(bounds));
                    state.insert(column_key(target, "means"), StateValue::Numbers(means));
                }
            } else {
                let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
                for (cells, count) in &tuples {
                    if let Some(label) = cells[i].as_deref() {
                        *counts.entry(label).or_insert(0) += count;
                    }
                }
                let kept: Vec<String> = counts
                    .into_iter()
                    .filter(|&(_, count)| count >= k)
                    .map(|(label, _)| label.to_string())
                    .collect();
                debug!(column = %target, kept = kept.len(), "frequent quasi-identifier values");
                state.insert(column_key(target, "kept"), StateValue::Texts(kept));
            }
        }

        if config.bool_or("verify", true)? {
            let generalizers = targets
                .iter()
                .map(|t| Generalizer::from_state(&state, config, t))
                .collect::<Result<Vec<_>>>()?;
            let mut classes: BTreeMap<String, u64> = BTreeMap::new();
            for (cells, count) in &tuples {
                let generalized: Vec<Option<String>> = cells
                    .iter()
                    .zip(&generalizers)
                    .map(|(raw, g)| g.apply(raw.as_deref()).map(|c| c.key()))
                    .collect();
                *classes.entry(tuple_key(&generalized)?).or_insert(0) += count;
            }
            let (allowed, violating): (Vec<_>, Vec<_>) =
                classes.into_iter().partition(|&(_, count)| count >= k);
            if !violating.is_empty() {
                let rows: u64 = violating.iter().map(|(_, count)| count).sum();
                warn!(
                    combinations = violating.len(),
                    rows,
                    k,
                    "k-anonymity not met by generalization alone; suppressing records"
                );
            }
            state.insert(
                COMBINATIONS,
                StateValue::Texts(allowed.into_iter().map(|(key, _)| key).collect()),
            );
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
        let targets = &config.target_columns;
        let mut generalized: Vec<(bool, Vec<Option<Cell>>)> = Vec::with_capacity(targets.len());
        for target in targets {
            let generalizer = Generalizer::from_state(state, config, target)?;
            let is_mean = matches!(generalizer, Generalizer::Groups { .. });
            let numeric = is_mean || matches!(generalizer, Generalizer::Bins(_));
            let series = require_column(partition, target, self.kind())?;
            let cells = raw_values(series, numeric, self.kind())?
                .iter()
                .map(|raw| generalizer.apply(raw.as_deref()))
                .collect();
            generalized.push((is_mean, cells));
        }

        let height = partition.height();
        let mut violating = vec![false; height];
        if let Some(StateValue::Texts(allowed)) = state.get(COMBINATIONS) {
            let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
            for (row, flag) in violating.iter_mut().enumerate() {
                let keys: Vec<Option<String>> = generalized
                    .iter()
                    .map(|(_, column)| column[row].as_ref().map(Cell::key))
                    .collect();
                *flag = !allowed.contains(tuple_key(&keys)?.as_str());
            }
        }
        let suppressed = violating.iter().filter(|&&v| v).count();
        let drop = Self::drops_records(config)?;
        if suppressed > 0 {
            debug!(rows = suppressed, drop, "suppressed records");
        }

        let mut out = partition.clone();
        for (target, (is_mean, cells)) in targets.iter().zip(generalized) {
            let masked = cells
                .into_iter()
                .zip(&violating)
                .map(|(cell, &v)| if v && !drop { None } else { cell });
            if is_mean {
                let values = masked
                    .map(|cell| match cell {
                        Some(Cell::Mean(m)) => Some(m),
                        _ => None,
                    })
                    .collect();
                put_f64_column(&mut out, target, values)?;
            } else {
                let values = masked.map(|cell| cell.map(|c| c.key())).collect();
                put_str_column(&mut out, target, values)?;
            }
        }

        if drop && suppressed > 0 {
            let keep: Vec<usize> = (0..height).filter(|&row| !violating[row]).collect();
            out = take_rows(&out, &keep)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Combine;

    fn fit(df: &DataFrame, config: &StageConfig) -> Result<StageState> {
        let acc = KAnonymity.accumulate(df, config)?;
        KAnonymity.finalize(acc, config)
    }

    fn strings(df: &DataFrame, name: &str) -> Vec<Option<String>> {
        string_values(df.column(name).unwrap().as_materialized_series()).unwrap()
    }

    fn people() -> DataFrame {
        df![
            "age" => [21.0, 22.0, 23.0, 24.0, 41.0, 42.0, 43.0, 44.0, 61.0, 90.0],
            "zip" => ["100", "100", "100", "100", "200", "200", "200", "300", "200", "100"],
        ]
        .unwrap()
    }

    #[test]
    fn test_microaggregation_groups_of_k() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let (bounds, means) = micro_groups(&sorted, 3);
        assert_eq!(bounds, vec![3.0, 7.0]);
        assert_eq!(means, vec![2.0, 5.5]);
    }

    #[test]
    fn test_binning_labels_and_record_suppression() {
        let config = StageConfig::new("k_anonymity", ["age", "zip"]).param("bin_count", 2);
        let df = people();
        let state = fit(&df, &config).unwrap();
        assert_eq!(state.text("age.method").unwrap(), "binning");
        assert_eq!(state.numbers("age.edges").unwrap(), vec![21.0, 41.5, 90.0]);
        assert_eq!(state.texts("zip.kept").unwrap(), vec!["100", "200"]);

        let out = KAnonymity.transform(&df, &state, &config, None).unwrap();
        let ages = strings(&out, "age");
        let zips = strings(&out, "zip");
        assert_eq!(ages[0].as_deref(), Some("21.00-41.50"));
        assert_eq!(zips[0].as_deref(), Some("100"));
        // rows 4, 7 and 9 are alone in their combination
        for row in [4, 7, 9] {
            assert_eq!((ages[row].clone(), zips[row].clone()), (None, None), "row {row}");
        }
        assert_eq!(ages[5].as_deref(), Some("41.50-90.00"));
        assert_eq!(zips[8].as_deref(), Some("200"));
        assert_eq!(ages.iter().filter(|a| a.is_none()).count(), 3);
    }

    #[test]
    fn test_drop_records_and_microaggregation() {
        let config = StageConfig::new("k_anonymity", ["age", "zip"])
            .param("numerical_method", "microaggregation")
            .param("k", 2)
            .param("record_suppression", "drop");
        let df = people();
        let state = fit(&df, &config).unwrap();
        assert_eq!(
            state.numbers("age.means").unwrap(),
            vec![21.5, 23.5, 41.5, 43.5, 75.5]
        );
        let out = KAnonymity.transform(&df, &state, &config, None).unwrap();
        // rows 6 to 9 are alone in their combination
        assert_eq!(out.height(), 6);
        let ages = out.column("age").unwrap().as_materialized_series().f64().unwrap();
        assert_eq!(ages.get(0), Some(21.5));
        assert_eq!(ages.null_count(), 0);
    }

    #[test]
    fn test_verify_off_keeps_every_record() {
        let config = StageConfig::new("k_anonymity", ["age", "zip"])
            .param("bin_count", 2)
            .param("verify", false);
        let df = people();
        let state = fit(&df, &config).unwrap();
        assert!(state.get(COMBINATIONS).is_none());
        let out = KAnonymity.transform(&df, &state, &config, None).unwrap();
        assert_eq!(strings(&out, "zip")[7].as_deref(), Some("Other"));
        assert_eq!(strings(&out, "age")[9].as_deref(), Some("41.50-90.00"));
    }

    #[test]
    fn test_unseen_combination_is_suppressed() {
        let config = StageConfig::new("k_anonymity", ["age", "zip"]).param("bin_count", 2);
        let state = fit(&people(), &config).unwrap();
        let fresh = df!["age" => [22.0, 22.0], "zip" => ["200", "100"]].unwrap();
        let out = KAnonymity.transform(&fresh, &state, &config, None).unwrap();
        assert_eq!(strings(&out, "zip"), vec![None, Some("100".to_string())]);
    }

    #[test]
    fn test_state_does_not_depend_on_partitioning() {
        let config = StageConfig::new("k_anonymity", ["age", "zip"])
            .param("numerical_method", "microaggregation")
            .param("k", 3);
        let df = people();
        let whole = fit(&df, &config).unwrap();
        let acc = [df.slice(7, 3), df.slice(0, 4), df.slice(4, 3)]
            .iter()
            .map(|part| KAnonymity.accumulate(part, &config).unwrap())
            .reduce(Combine::combine)
            .unwrap();
        assert_eq!(KAnonymity.finalize(acc, &config).unwrap(), whole);
    }

    #[test]
    fn test_output_schema_follows_method() {
        let schema = Schema::builder()
            .spec(crate::schema::ColumnSpec::new("age", ColumnType::Numeric).nullable(false))
            .column("zip", ColumnType::Categorical)
            .build()
            .unwrap();
        let config = StageConfig::new("k_anonymity", ["age", "zip"]);
        let out = KAnonymity.output_schema(&schema, &config, None).unwrap().unwrap();
        assert_eq!(out.get("age").unwrap().dtype, ColumnType::Categorical);
        assert!(out.get("age").unwrap().nullable);

        let config = config
            .param("numerical_method", "microaggregation")
            .param("record_suppression", "drop");
        let out = KAnonymity.output_schema(&schema, &config, None).unwrap().unwrap();
        assert_eq!(out.get("age").unwrap().dtype, ColumnType::Numeric);
        assert!(!out.get("age").unwrap().nullable);
    }

    #[test]
    fn test_config_bounds() {
        let base = StageConfig::new("k_anonymity", ["age"]);
        assert!(KAnonymity.validate_config(&base.clone().param("k", 1)).is_err());
        assert!(KAnonymity.validate_config(&base.clone().param("bin_count", 1)).is_err());
        assert!(
            KAnonymity
                .validate_config(&base.clone().param("numerical_method", "rounding"))
                .is_err()
        );
        assert!(
            KAnonymity
                .validate_config(&base.param("record_suppression", "mask"))
                .is_err()
        );
    }
}
