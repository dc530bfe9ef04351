//! Fitted stage state.
//!
//! A [`StageState`] is a flat, ordered map from keys to [`StateValue`]s.
//! Column-scoped entries use `"{column}.{field}"` keys. Values are only ever
//! plain numbers, strings and flags, so the JSON form round-trips exactly.

use crate::error::{ErrorContext, Result, WipekitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Number(f64),
    Integer(i64),
    Text(String),
    Numbers(Vec<f64>),
    Texts(Vec<String>),
    Flag(bool),
}

impl StateValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::Numbers(_) => "numbers",
            Self::Texts(_) => "texts",
            Self::Flag(_) => "flag",
        }
    }
}

/// Key for a column-scoped state entry.
pub fn column_key(column: &str, field: &str) -> String {
    format!("{column}.{field}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageState {
    values: BTreeMap<String, StateValue>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $name(&self, key: &str) -> Result<$ty> {
            match self.values.get(key) {
                Some(StateValue::$variant(v)) => Ok(v.clone()),
                Some(other) => Err(Self::wrong_type(key, $label, other)),
                None => Err(Self::missing(key)),
            }
        }
    };
}

impl StageState {
    /// State of a stage that learns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: StateValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.values.iter()
    }

    fn missing(key: &str) -> WipekitError {
        WipekitError::configuration(
            ErrorContext::new(),
            format!("fitted state has no entry '{key}'"),
        )
    }

    fn wrong_type(key: &str, expected: &str, found: &StateValue) -> WipekitError {
        WipekitError::configuration(
            ErrorContext::new(),
            format!(
                "fitted state entry '{key}' is {}, expected {expected}",
                found.type_name()
            ),
        )
    }

    typed_getter!(number, Number, f64, "number");
    typed_getter!(integer, Integer, i64, "integer");
    typed_getter!(text, Text, String, "text");
    typed_getter!(numbers, Numbers, Vec<f64>, "numbers");
    typed_getter!(texts, Texts, Vec<String>, "texts");
    typed_getter!(flag, Flag, bool, "flag");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let state = StageState::empty()
            .with(column_key("age", "mean"), StateValue::Number(41.25))
            .with(
                column_key("city", "categories"),
                StateValue::Texts(vec!["a".into(), "b".into()]),
            );
        assert_eq!(state.number("age.mean").unwrap(), 41.25);
        assert_eq!(state.texts("city.categories").unwrap().len(), 2);
        assert!(state.number("city.categories").is_err());
        assert!(state.number("nope").is_err());
    }

    #[test]
    fn test_json_roundtrip_is_exact() {
        let awkward = 0.1 + 0.2;
        let state = StageState::empty()
            .with("x.mean", StateValue::Number(awkward))
            .with("x.edges", StateValue::Numbers(vec![1.0 / 3.0, 2e-308, -7.5]));
        let json = serde_json::to_string(&state).unwrap();
        let back: StageState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.number("x.mean").unwrap().to_bits(), awkward.to_bits());
        assert_eq!(back, state);
    }
}
