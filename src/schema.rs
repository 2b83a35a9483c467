//! Schema adapter
//!
//! A `Schema` validates an untyped `serde_json::Value` and returns the
//! (possibly normalized) value or a `SchemaError` with every issue found.
//! Three adapters cover the runtime's needs: compiled JSON Schema documents,
//! serde round-trips for Rust types, and a pass-through.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{SchemaError, SchemaIssue};

/// Synchronous validator over untyped JSON values.
///
/// Validation may normalize: the returned value is what gets stored, not
/// necessarily the input.
pub trait Schema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<Value, SchemaError>;

    /// Short description used in diagnostics
    fn describe(&self) -> &str {
        "schema"
    }
}

/// Shared schema handle used throughout the runtime
pub type SchemaRef = Arc<dyn Schema>;

/// A compiled JSON Schema document
pub struct JsonSchema {
    compiled: jsonschema::Validator,
    raw: Value,
}

impl JsonSchema {
    /// Compile a schema document. Fails if the document itself is invalid.
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|e| SchemaError::single("", format!("invalid schema document: {}", e)))?;
        Ok(Self {
            compiled,
            raw: schema,
        })
    }

    /// Compile into a shared handle
    pub fn shared(schema: Value) -> Result<SchemaRef, SchemaError> {
        Ok(Arc::new(Self::new(schema)?))
    }

    /// The schema document this validator was compiled from
    pub fn document(&self) -> &Value {
        &self.raw
    }
}

impl Schema for JsonSchema {
    fn validate(&self, value: &Value) -> Result<Value, SchemaError> {
        let issues: Vec<SchemaIssue> = self
            .compiled
            .iter_errors(value)
            .map(|e| SchemaIssue::new(e.instance_path.to_string(), e.to_string()))
            .collect();
        if issues.is_empty() {
            Ok(value.clone())
        } else {
            Err(SchemaError::new(issues))
        }
    }

    fn describe(&self) -> &str {
        "json-schema"
    }
}

/// Serde round-trip validation for a concrete Rust type.
///
/// Deserializes into `T` and reserializes, so the stored value is the
/// normalized form (defaults filled, unknown-field policy applied, etc.).
pub struct Typed<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Schema for Typed<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<Value, SchemaError> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| SchemaError::single("", e.to_string()))?;
        serde_json::to_value(&typed).map_err(|e| SchemaError::single("", e.to_string()))
    }

    fn describe(&self) -> &str {
        std::any::type_name::<T>()
    }
}

/// Shared handle for a serde round-trip schema
pub fn typed<T>() -> SchemaRef
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(Typed::<T>::new())
}

/// Accepts any value unchanged
pub struct AnySchema;

impl Schema for AnySchema {
    fn validate(&self, value: &Value) -> Result<Value, SchemaError> {
        Ok(value.clone())
    }

    fn describe(&self) -> &str {
        "any"
    }
}

/// Shared handle for the pass-through schema
pub fn any_schema() -> SchemaRef {
    Arc::new(AnySchema)
}
