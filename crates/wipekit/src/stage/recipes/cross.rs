//! Degree-2 polynomial features.

use super::{NUMERIC, append_columns};
use crate::error::{Result, WipekitError};
use crate::schema::{ColumnSpec, ColumnType, Schema};
use crate::stage::{Stage, StageCategory, StageConfig, StageState, output_collision};
use crate::utils::{numeric_values, put_f64_column, require_column};
use polars::prelude::*;

/// Appends `{a}_pow2` for each target and `{a}_x_{b}` for each pair in
/// target order. With `interaction_only` only the products are produced.
/// A null factor gives a null product.
#[derive(Debug, Clone, Copy, Default)]
pub struct Polynomial;

enum Term {
    Square(usize),
    Product(usize, usize),
}

impl Polynomial {
    fn terms(config: &StageConfig) -> Result<Vec<(String, Term)>> {
        let interaction_only = config.bool_or("interaction_only", false)?;
        let targets = &config.target_columns;
        let mut terms = Vec::new();
        if !interaction_only {
            for (i, a) in targets.iter().enumerate() {
                terms.push((format!("{a}_pow2"), Term::Square(i)));
            }
        }
        for (i, a) in targets.iter().enumerate() {
            for (j, b) in targets.iter().enumerate().skip(i + 1) {
                terms.push((format!("{a}_x_{b}"), Term::Product(i, j)));
            }
        }
        Ok(terms)
    }
}

impl Stage for Polynomial {
    fn kind(&self) -> &'static str {
        "polynomial"
    }

    fn category(&self) -> StageCategory {
        StageCategory::CrossFeature
    }

    fn allowed_hyperparameters(&self) -> &'static [&'static str] {
        &["degree", "interaction_only"]
    }

    fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
        NUMERIC
    }

    fn validate_config(&self, config: &StageConfig) -> Result<()> {
        let degree = config.usize_or("degree", 2)?;
        if degree != 2 {
            return Err(WipekitError::configuration(
                config.context(),
                format!("only degree 2 is supported, got {degree}"),
            ));
        }
        if config.bool_or("interaction_only", false)? && config.target_columns.len() < 2 {
            return Err(WipekitError::configuration(
                config.context(),
                "interaction_only needs at least two target columns",
            ));
        }
        Ok(())
    }

    fn output_schema(
        &self,
        input: &Schema,
        config: &StageConfig,
        _state: Option<&StageState>,
    ) -> Result<Option<Schema>> {
        let nullable = config
            .target_columns
            .iter()
            .any(|t| input.get(t).is_none_or(|spec| spec.nullable));
        let specs = Self::terms(config)?
            .into_iter()
            .map(|(name, _)| ColumnSpec::new(name, ColumnType::Numeric).nullable(nullable));
        append_columns(input.clone(), config, specs).map(Some)
    }

    fn transform(
        &self,
        partition: &DataFrame,
        _state: &StageState,
        config: &StageConfig,
        _context: Option<&DataFrame>,
    ) -> Result<DataFrame> {
        let columns = config
            .target_columns
            .iter()
            .map(|t| numeric_values(require_column(partition, t, self.kind())?, self.kind()))
            .collect::<Result<Vec<_>>>()?;
        let mut out = partition.clone();
        for (name, term) in Self::terms(config)? {
            if out.get_column_index(&name).is_some() {
                return Err(output_collision(config, &name));
            }
            let (a, b) = match term {
                Term::Square(i) => (&columns[i], &columns[i]),
                Term::Product(i, j) => (&columns[i], &columns[j]),
            };
            let values: Vec<Option<f64>> = a
                .iter()
                .zip(b)
                .map(|(x, y)| Some((*x)? * (*y)?))
                .collect();
            put_f64_column(&mut out, &name, values)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squares_and_products() {
        let df = df!["a" => [Some(2.0), None], "b" => [Some(3.0), Some(4.0)]].unwrap();
        let config = StageConfig::new("polynomial", ["a", "b"]);
        let out = Polynomial
            .transform(&df, &StageState::empty(), &config, None)
            .unwrap();
        let names: Vec<&str> = out.get_column_names().iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a_pow2", "b_pow2", "a_x_b"]);
        let ab: Vec<Option<f64>> = out
            .column("a_x_b")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(ab, vec![Some(6.0), None]);
    }

    #[test]
    fn test_interaction_only_needs_pairs() {
        let config = StageConfig::new("polynomial", ["a"]).param("interaction_only", true);
        assert!(Polynomial.validate_config(&config).is_err());
        let config = StageConfig::new("polynomial", ["a"]).param("degree", 3);
        assert!(Polynomial.validate_config(&config).is_err());
    }
}
