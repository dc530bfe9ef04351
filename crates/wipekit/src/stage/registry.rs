//! Name → implementation lookup for stage kinds.

use super::Stage;
use super::recipes;
use crate::error::{ErrorContext, Result, WipekitError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Catalogue of stage kinds, keyed by [`Stage::kind`].
///
/// Deserialization resolves kinds through a registry, so pipelines that use
/// custom stages must be loaded with a registry those stages were added to.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// A registry with no stages.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every bundled recipe.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for stage in recipes::bundled() {
            registry.stages.insert(stage.kind().to_string(), stage);
        }
        registry
    }

    /// Add a stage kind. Re-registering a kind is a configuration error.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<()> {
        let kind = stage.kind();
        if self.stages.contains_key(kind) {
            return Err(WipekitError::configuration(
                ErrorContext::new().stage(kind),
                "stage kind is already registered",
            ));
        }
        self.stages.insert(kind.to_string(), stage);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Stage>> {
        self.stages.get(kind).cloned().ok_or_else(|| {
            WipekitError::configuration(
                ErrorContext::new().stage(kind),
                format!(
                    "unknown stage kind (known: {})",
                    self.kinds().collect::<Vec<_>>().join(", ")
                ),
            )
        })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.stages.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, Schema};
    use crate::stage::{StageCategory, StageConfig, StageState};
    use polars::prelude::DataFrame;

    #[derive(Debug)]
    struct Identity;

    impl Stage for Identity {
        fn kind(&self) -> &'static str {
            "identity"
        }
        fn category(&self) -> StageCategory {
            StageCategory::RowWise
        }
        fn allowed_hyperparameters(&self) -> &'static [&'static str] {
            &[]
        }
        fn accepted_types(&self, _config: &StageConfig) -> &'static [ColumnType] {
            &[ColumnType::Numeric]
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
            _config: &StageConfig,
            _context: Option<&DataFrame>,
        ) -> Result<DataFrame> {
            Ok(partition.clone())
        }
    }

    #[test]
    fn test_defaults_cover_catalogue() {
        let registry = StageRegistry::with_defaults();
        for kind in [
            "trim_whitespace",
            "impute",
            "standard_scale",
            "minmax_scale",
            "label_encode",
            "one_hot",
            "quantile_bin",
            "rare_category",
            "k_anonymity",
            "lag",
            "rolling_mean",
            "polynomial",
        ] {
            assert!(registry.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn test_register_custom_stage() {
        let mut registry = StageRegistry::with_defaults();
        registry.register(Arc::new(Identity)).unwrap();
        assert!(registry.get("identity").is_ok());
        assert!(registry.register(Arc::new(Identity)).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let err = StageRegistry::empty().get("nope").unwrap_err();
        assert!(matches!(err, WipekitError::Configuration { .. }));
    }
}
