//! Persistable form of a fitted pipeline.

use crate::config::DriftConfig;
use crate::drift::ReferenceSnapshot;
use crate::error::{Result, WipekitError};
use crate::pipeline::fitted::{FittedPipeline, FittedStage};
use crate::schema::Schema;
use crate::stage::{self, StageConfig, StageRegistry, StageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Version written by [`FittedPipeline::serialize`]. Other versions are
/// rejected on load.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedStage {
    pub config: StageConfig,
    pub state: StageState,
}

/// A fitted pipeline as plain data. Where it is stored is up to the caller;
/// [`to_json`](Self::to_json) and [`from_json`](Self::from_json) cover the
/// common case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedPipeline {
    pub format_version: u32,
    pub fitted_at: DateTime<Utc>,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub stages: Vec<SerializedStage>,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceSnapshot>,
}

impl SerializedPipeline {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl FittedPipeline {
    pub fn serialize(&self) -> SerializedPipeline {
        SerializedPipeline {
            format_version: FORMAT_VERSION,
            fitted_at: self.fitted_at(),
            input_schema: self.input_schema().clone(),
            output_schema: self.output_schema().clone(),
            stages: self
                .stages()
                .iter()
                .map(|s| SerializedStage {
                    config: s.config().clone(),
                    state: s.state().clone(),
                })
                .collect(),
            drift: self.drift_config().clone(),
            reference: self.reference().cloned(),
        }
    }

    /// Rebuild a pipeline, resolving stage kinds through `registry`.
    ///
    /// Every config is re-validated and the schema chain is replayed from the
    /// stored input schema; a chain that does not end at the stored output
    /// schema means the stages behave differently from when they were fitted.
    pub fn deserialize(serialized: SerializedPipeline, registry: &StageRegistry) -> Result<Self> {
        if serialized.format_version != FORMAT_VERSION {
            return Err(WipekitError::Serialization(format!(
                "unsupported format version {} (expected {})",
                serialized.format_version, FORMAT_VERSION
            )));
        }

        let mut schema = serialized.input_schema.clone();
        let mut stages = Vec::with_capacity(serialized.stages.len());
        for SerializedStage { config, state } in serialized.stages {
            let stage = registry.get(&config.kind)?;
            stage::check_config(stage.as_ref(), &config)?;
            stage::check_targets(stage.as_ref(), &config, &schema)?;
            schema = stage
                .output_schema(&schema, &config, Some(&state))?
                .ok_or_else(|| {
                    WipekitError::Serialization(format!(
                        "stage '{}' produced no output schema from its stored state",
                        config.kind
                    ))
                })?;
            stages.push(FittedStage::new(config, state, stage));
        }
        if schema != serialized.output_schema {
            return Err(WipekitError::Serialization(
                "stored output schema does not match the one derived from the stages".into(),
            ));
        }
        debug!(stages = stages.len(), "pipeline deserialized");

        Ok(FittedPipeline::new(
            serialized.input_schema,
            serialized.output_schema,
            stages,
            serialized.reference,
            serialized.drift,
            serialized.fitted_at,
        ))
    }
}
