//! Declarative stage configuration.

use crate::error::{ErrorContext, Result, WipekitError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which stage to run, on which columns, with which hyperparameters.
///
/// Immutable once part of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: String,
    pub target_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hyperparameters: BTreeMap<String, Value>,
}

impl StageConfig {
    pub fn new<I, S>(kind: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.into(),
            target_columns: targets.into_iter().map(Into::into).collect(),
            hyperparameters: BTreeMap::new(),
        }
    }

    /// Set a hyperparameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hyperparameters.insert(key.into(), value.into());
        self
    }

    pub fn context(&self) -> ErrorContext {
        ErrorContext::new().stage(self.kind.as_str())
    }

    fn invalid(&self, key: &str, expected: &str) -> WipekitError {
        WipekitError::configuration(
            self.context(),
            format!("hyperparameter '{key}' must be {expected}"),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.hyperparameters.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(self.invalid(key, "a boolean")),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a finite number")),
            Some(_) => Err(self.invalid(key, "a number")),
        }
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|v| Some(v as usize))
                .ok_or_else(|| self.invalid(key, "a non-negative integer")),
            Some(_) => Err(self.invalid(key, "a non-negative integer")),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.get_f64(key)?.unwrap_or(default))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        Ok(self.get_usize(key)?.unwrap_or(default))
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        Ok(self.get_str(key)?.unwrap_or(default))
    }

    /// A string hyperparameter restricted to `choices`.
    pub fn choice<'a>(&'a self, key: &str, choices: &[&'a str], default: &'a str) -> Result<&'a str> {
        let value = self.str_or(key, default)?;
        if choices.contains(&value) {
            Ok(value)
        } else {
            Err(self.invalid(key, &format!("one of {}", choices.join(", "))))
        }
    }

    /// A required string hyperparameter.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)?.ok_or_else(|| {
            WipekitError::configuration(
                self.context(),
                format!("missing required hyperparameter '{key}'"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters() {
        let config = StageConfig::new("impute", ["a"])
            .param("strategy", "median")
            .param("invertible", false)
            .param("window", 3)
            .param("fill_value", 1.5);

        assert_eq!(config.get_str("strategy").unwrap(), Some("median"));
        assert_eq!(config.get_bool("invertible").unwrap(), Some(false));
        assert_eq!(config.get_usize("window").unwrap(), Some(3));
        assert_eq!(config.get_f64("fill_value").unwrap(), Some(1.5));
        assert_eq!(config.usize_or("missing", 7).unwrap(), 7);
    }

    #[test]
    fn test_wrong_type_is_configuration_error() {
        let config = StageConfig::new("lag", ["a"]).param("periods", json!("two"));
        let err = config.get_usize("periods").unwrap_err();
        assert!(matches!(err, WipekitError::Configuration { .. }));
        assert!(err.to_string().contains("stage=lag"));

        let negative = StageConfig::new("lag", ["a"]).param("periods", -1);
        assert!(negative.get_usize("periods").is_err());
    }

    #[test]
    fn test_choice() {
        let config = StageConfig::new("impute", ["a"]).param("strategy", "magic");
        assert!(config.choice("strategy", &["mean", "median"], "mean").is_err());
        let config = StageConfig::new("impute", ["a"]);
        assert_eq!(
            config.choice("strategy", &["mean", "median"], "mean").unwrap(),
            "mean"
        );
    }

    #[test]
    fn test_serde_skips_empty_hyperparameters() {
        let config = StageConfig::new("trim_whitespace", ["name"]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hyperparameters"));
        let back: StageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
