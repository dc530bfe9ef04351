//! Logical schemas and the schema registry.
//!
//! A [`Schema`] is an ordered list of uniquely named [`ColumnSpec`]s. It is
//! proposed from data with [`SchemaRegistry::infer`], adjusted by the caller
//! (roles, geospatial/graph-id types), checked against later batches with
//! [`SchemaRegistry::validate`], and frozen inside a fitted pipeline.

pub mod inference;
pub mod validation;

pub use validation::{ValidationResult, Violation};

use crate::backend::ExecutionBackend;
use crate::config::InferenceConfig;
use crate::dataset::Dataset;
use crate::error::{ErrorContext, Result, WipekitError};
use crate::utils::{DtypeCategory, get_dtype_category};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
    Text,
    Temporal,
    Geospatial,
    GraphId,
    /// Only produced by inference for columns with no non-null value.
    Unknown,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Categorical => "categorical",
            Self::Text => "text",
            Self::Temporal => "temporal",
            Self::Geospatial => "geospatial",
            Self::GraphId => "graph_id",
            Self::Unknown => "unknown",
        }
    }

    /// Whether data observed as `observed` may fill a column declared as
    /// `self`.
    ///
    /// Categorical and text differ only in cardinality, which a small batch
    /// cannot establish, so the two accept each other.
    pub fn accepts(&self, observed: ColumnType, nullable: bool) -> bool {
        use ColumnType::*;
        if observed == Unknown {
            return nullable || *self == Unknown;
        }
        match self {
            Numeric => observed == Numeric,
            Categorical => matches!(observed, Categorical | Text | Numeric),
            Text => matches!(observed, Text | Categorical | Numeric),
            Temporal => observed == Temporal,
            Geospatial => matches!(observed, Geospatial | Text | Categorical),
            GraphId => matches!(observed, GraphId | Categorical | Numeric | Text),
            Unknown => true,
        }
    }

    /// Scan-free check of a physical polars dtype against this logical type.
    pub fn admits_dtype(&self, dtype: &DataType) -> bool {
        let category = get_dtype_category(dtype);
        if category == DtypeCategory::Null {
            return true;
        }
        match self {
            Self::Numeric => matches!(
                category,
                DtypeCategory::Numeric | DtypeCategory::Boolean | DtypeCategory::String
            ),
            Self::Categorical | Self::GraphId => matches!(
                category,
                DtypeCategory::String | DtypeCategory::Numeric | DtypeCategory::Boolean
            ),
            Self::Text => matches!(category, DtypeCategory::String),
            Self::Temporal => matches!(category, DtypeCategory::Datetime | DtypeCategory::String),
            Self::Geospatial => matches!(category, DtypeCategory::String | DtypeCategory::Other),
            Self::Unknown => true,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a column is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    #[default]
    Feature,
    Target,
    Identifier,
    OrderingKey,
}

/// One column of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub role: ColumnRole,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: true,
            role: ColumnRole::Feature,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn role(mut self, role: ColumnRole) -> Self {
        self.role = role;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaRepr {
    columns: Vec<ColumnSpec>,
}

/// Ordered, uniquely named column specifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaRepr", into = "SchemaRepr")]
pub struct Schema {
    columns: Vec<ColumnSpec>,
}

impl TryFrom<SchemaRepr> for Schema {
    type Error = WipekitError;

    fn try_from(repr: SchemaRepr) -> Result<Self> {
        Schema::new(repr.columns)
    }
}

impl From<Schema> for SchemaRepr {
    fn from(schema: Schema) -> Self {
        Self {
            columns: schema.columns,
        }
    }
}

impl Schema {
    /// Create a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(WipekitError::configuration(
                    ErrorContext::new().column(column.name.as_str()),
                    "duplicate column name in schema",
                ));
            }
        }
        Ok(Self { columns })
    }

    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The column declared with [`ColumnRole::OrderingKey`], if any.
    pub fn ordering_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.role == ColumnRole::OrderingKey)
            .map(|c| c.name.as_str())
    }

    /// Copy of this schema with `name` retyped.
    pub fn with_column_type(&self, name: &str, dtype: ColumnType) -> Result<Self> {
        self.update(name, |spec| spec.dtype = dtype)
    }

    /// Copy of this schema with `name` assigned `role`.
    pub fn with_role(&self, name: &str, role: ColumnRole) -> Result<Self> {
        self.update(name, |spec| spec.role = role)
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut ColumnSpec)) -> Result<Self> {
        let mut next = self.clone();
        let spec = next
            .columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                WipekitError::configuration(
                    ErrorContext::new().column(name),
                    "column is not part of the schema",
                )
            })?;
        apply(spec);
        Ok(next)
    }

    /// Replace the spec with the same name in place, or append it.
    pub fn upsert(mut self, spec: ColumnSpec) -> Self {
        match self.columns.iter_mut().find(|c| c.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.columns.push(spec),
        }
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.columns.retain(|c| c.name != name);
        self
    }

    /// Presence and physical dtype check that reads no data.
    pub fn check_structure(&self, df: &DataFrame) -> Result<()> {
        let mut problems = Vec::new();
        for spec in &self.columns {
            match df.column(&spec.name) {
                Err(_) => problems.push(format!("'{}' is missing", spec.name)),
                Ok(column) if !spec.dtype.admits_dtype(column.dtype()) => problems.push(format!(
                    "'{}' has dtype {} which cannot hold {}",
                    spec.name,
                    column.dtype(),
                    spec.dtype
                )),
                Ok(_) => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(WipekitError::schema_mismatch(
                ErrorContext::new(),
                problems.join("; "),
            ))
        }
    }
}

/// Builder for [`Schema`] with fluent API.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSpec>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: impl Into<String>, dtype: ColumnType) -> Self {
        self.columns.push(ColumnSpec::new(name, dtype));
        self
    }

    pub fn spec(mut self, spec: ColumnSpec) -> Self {
        self.columns.push(spec);
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::new(self.columns)
    }
}

/// Proposes and validates schemas over any backend.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    config: InferenceConfig,
}

impl SchemaRegistry {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Propose a schema from data in one streaming pass.
    pub fn infer<B: ExecutionBackend>(&self, dataset: &Dataset, backend: &B) -> Result<Schema> {
        inference::infer_schema(dataset, backend, &self.config)
    }

    /// Report every way `dataset` deviates from `schema`. Never mutates
    /// the data.
    pub fn validate<B: ExecutionBackend>(
        &self,
        dataset: &Dataset,
        schema: &Schema,
        backend: &B,
    ) -> Result<ValidationResult> {
        validation::validate_dataset(dataset, schema, backend, &self.config)
    }
}
