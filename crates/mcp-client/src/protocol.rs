//! Wire types for MCP over SSE.
//!
//! Every outgoing message is an [`Envelope`] POSTed to the session endpoint.
//! Replies come back as `message` events on the server's stream and are
//! parsed with [`Reply::from_event`]; anything without an `id` (server
//! notifications, progress pings) is not a reply and is skipped.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// The MCP methods this client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    ListTools,
    CallTool,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::Initialized => "notifications/initialized",
            Method::ListTools => "tools/list",
            Method::CallTool => "tools/call",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outgoing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC message body. Notifications carry no `id`.
#[derive(Debug, Serialize)]
pub struct Envelope {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Envelope {
    pub fn request(id: u64, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.as_str(),
            params,
        }
    }

    pub fn notification(method: Method) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.as_str(),
            params: None,
        }
    }
}

/// `initialize` parameters announcing this client.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "threadmind", "version": env!("CARGO_PKG_VERSION")},
    })
}

/// `tools/call` parameters.
pub fn call_params(tool: &str, arguments: Value) -> Value {
    json!({"name": tool, "arguments": arguments})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The answer to one request, matched by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

impl Reply {
    /// Parse the data of an SSE `message` event. `None` when the event is
    /// not a reply to one of our requests.
    pub fn from_event(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }

    #[cfg(test)]
    pub(crate) fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn outcome(self) -> Result<Value, RpcFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// An `error` object in a reply.
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("server error {code}: {message}")]
pub struct RpcFault {
    pub code: i64,
    pub message: String,
}

/// One tool a server offers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<RemoteToolDef>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentItem {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default)]
    is_error: bool,
}

impl CallToolResult {
    /// Text items joined with newlines; other content kinds are dropped.
    /// `Err` carries the text of a result the server flagged as failed.
    pub fn into_text(self) -> Result<String, String> {
        let text = self
            .content
            .into_iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text),
                ContentItem::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if self.is_error {
            Err(text)
        } else {
            Ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_have_no_id() {
        let body = serde_json::to_value(Envelope::notification(Method::Initialized)).unwrap();
        assert_eq!(body, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[test]
    fn call_request_shape() {
        let env = Envelope::request(7, Method::CallTool, Some(call_params("echo", json!({"text": "hi"}))));
        let body = serde_json::to_value(env).unwrap();
        assert_eq!(body["id"], 7);
        assert_eq!(body["method"], "tools/call");
        assert_eq!(body["params"]["arguments"]["text"], "hi");
    }

    #[test]
    fn list_request_omits_params() {
        let body = serde_json::to_value(Envelope::request(2, Method::ListTools, None)).unwrap();
        assert!(body.get("params").is_none());
    }

    #[test]
    fn server_notifications_are_not_replies() {
        assert!(Reply::from_event(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).is_none());
        assert!(Reply::from_event("not json").is_none());
    }

    #[test]
    fn fault_reply() {
        let reply = Reply::from_event(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(reply.id, 3);
        let fault = reply.outcome().unwrap_err();
        assert_eq!(fault.to_string(), "server error -32601: Method not found");
    }

    #[test]
    fn tool_without_schema_gets_empty_object() {
        let list: ListToolsResult = serde_json::from_value(json!({"tools": [{"name": "ping"}]})).unwrap();
        assert_eq!(list.tools[0].description, "");
        assert_eq!(list.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn only_text_content_is_kept() {
        let result: CallToolResult = serde_json::from_value(json!({"content": [
            {"type": "text", "text": "first"},
            {"type": "image", "data": "AAAA", "mimeType": "image/png"},
            {"type": "text", "text": "second"}
        ]}))
        .unwrap();
        assert_eq!(result.into_text().unwrap(), "first\nsecond");
    }

    #[test]
    fn flagged_result_is_err() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "rate limited"}],
            "isError": true
        }))
        .unwrap();
        assert_eq!(result.into_text().unwrap_err(), "rate limited");
    }
}
