//! Argument accessor handed to tool resolvers.
//!
//! Adapters leave the model's arguments as raw JSON. The resolver owns the
//! schema and the target type, so decoding happens here, after validation.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tm_domain::error::{Error, Result};

/// Model-supplied arguments for one tool call.
#[derive(Debug, Clone)]
pub struct ToolArgs {
    tool: String,
    value: Value,
    schema: Arc<Value>,
}

impl ToolArgs {
    pub fn new(tool: impl Into<String>, value: Value, schema: Arc<Value>) -> Self {
        Self {
            tool: tool.into(),
            value,
            schema,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// The arguments exactly as the model produced them.
    pub fn raw(&self) -> &Value {
        &self.value
    }

    /// Validate against the tool's schema, then decode into `T`.
    ///
    /// Both failures are tool errors, so the model sees them as the call's
    /// result instead of the request failing.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.validate()?;
        serde_json::from_value(self.value.clone()).map_err(|e| self.error(format!("bad arguments: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        // Models send strings when they fail to produce JSON.
        if let Value::String(raw) = &self.value {
            return Err(self.error(format!("arguments are not a JSON object: {raw}")));
        }
        if self.schema.is_null() || self.schema.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(());
        }

        let validator = jsonschema::validator_for(&self.schema)
            .map_err(|e| self.error(format!("invalid JSON schema: {e}")))?;
        let mut errors = validator.iter_errors(&self.value);
        match errors.next() {
            Some(first) => Err(self.error(format!("invalid arguments: {first}"))),
            None => Ok(()),
        }
    }

    fn error(&self, message: String) -> Error {
        Error::Tool {
            name: self.tool.clone(),
            message,
        }
    }
}
