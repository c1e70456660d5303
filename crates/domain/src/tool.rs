use crate::context::RequestContext;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Lifecycle of one tool invocation requested by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolUseStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Error,
    Success,
}

impl ToolUseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolUseStatus::Rejected | ToolUseStatus::Error | ToolUseStatus::Success
        )
    }
}

/// One attempted tool invocation and, once resolved, its result.
///
/// Status only moves forward: `pending -> accepted -> {success, error}` or
/// `pending -> rejected`. Records in `success`/`error` always carry a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    /// Opaque id assigned by the model.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Model-supplied arguments. Unparseable argument text is kept as a JSON
    /// string so the resolver can report it.
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub status: ToolUseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Result text recorded for a call the user declined.
pub const REJECTED_TOOL_RESULT: &str = "Tool call rejected by user";

impl ToolUse {
    pub fn pending(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            arguments,
            status: ToolUseStatus::Pending,
            result: None,
        }
    }

    /// Parse a raw argument string as emitted by a model. Empty input is an
    /// empty object; invalid JSON is preserved verbatim as a string value.
    pub fn arguments_from_raw(raw: &str) -> serde_json::Value {
        if raw.trim().is_empty() {
            return serde_json::Value::Object(Default::default());
        }
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn accept(&mut self) -> bool {
        if self.status != ToolUseStatus::Pending {
            return false;
        }
        self.status = ToolUseStatus::Accepted;
        true
    }

    pub fn reject(&mut self) -> bool {
        if self.status != ToolUseStatus::Pending {
            return false;
        }
        self.status = ToolUseStatus::Rejected;
        self.result = Some(REJECTED_TOOL_RESULT.to_owned());
        true
    }

    /// Record the outcome of running the tool. Only an accepted (or still
    /// pending) record can complete, and only once.
    pub fn complete(&mut self, outcome: std::result::Result<String, String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        match outcome {
            Ok(text) => {
                self.status = ToolUseStatus::Success;
                self.result = Some(text);
            }
            Err(message) => {
                self.status = ToolUseStatus::Error;
                self.result = Some(message);
            }
        }
        true
    }
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// The set of tools available to one request.
///
/// Implemented by the tool store; the request context carries it as a trait
/// object so resolvers and templates can see the context without depending
/// on the store crate.
#[async_trait::async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Stable, name-ordered enumeration for provider payloads.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run tool `name` with the model-supplied `arguments`.
    async fn resolve(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<String>;
}
