//! One initialized session with one tool server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tm_domain::config::McpServerConfig;
use tm_providers::network::AllowedHosts;

use crate::protocol::{self, CallToolResult, ListToolsResult, Method, RemoteToolDef, RpcFault};
use crate::transport::{McpTransport, SseTransport, TransportError};

/// Deadline for the handshake and tool listing.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct McpClient {
    /// Server ID from config.
    pub server_id: String,
    /// Tools discovered via `tools/list`.
    pub tools: Vec<RemoteToolDef>,
    call_timeout: Duration,
    transport: Box<dyn McpTransport>,
}

impl McpClient {
    /// Connect on behalf of `user_id`, perform the MCP handshake and
    /// discover tools.
    pub async fn connect(
        config: &McpServerConfig,
        user_id: &str,
        client: reqwest::Client,
        allowed: Arc<AllowedHosts>,
        call_timeout: Duration,
    ) -> Result<Self, McpError> {
        let transport = SseTransport::connect(config, user_id, client, allowed).await?;
        Self::initialize(&config.id, Box::new(transport), call_timeout).await
    }

    /// Handshake over an already open transport.
    pub async fn initialize(
        server_id: &str,
        transport: Box<dyn McpTransport>,
        call_timeout: Duration,
    ) -> Result<Self, McpError> {
        transport
            .send_request(Method::Initialize, Some(protocol::initialize_params()), SETUP_TIMEOUT)
            .await?
            .outcome()?;

        transport.send_notification(Method::Initialized).await?;

        let tools = match transport
            .send_request(Method::ListTools, None, SETUP_TIMEOUT)
            .await?
            .outcome()
        {
            Ok(value) => match serde_json::from_value::<ListToolsResult>(value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(server_id, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(server_id, error = %e, "tools/list returned error, server will have no tools");
                Vec::new()
            }
        };

        tracing::debug!(server_id, tool_count = tools.len(), "MCP client initialized");
        Ok(Self {
            server_id: server_id.to_string(),
            tools,
            call_timeout,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Call a tool and return its text content joined with newlines.
    ///
    /// A result flagged `isError` becomes [`McpError::ToolFailed`] carrying
    /// the server's text.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<String, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.server_id.clone()));
        }

        let value = self
            .transport
            .send_request(
                Method::CallTool,
                Some(protocol::call_params(tool_name, arguments)),
                self.call_timeout,
            )
            .await?
            .outcome()?;

        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("unreadable tools/call result: {e}")))?;
        result.into_text().map_err(McpError::ToolFailed)
    }

    pub async fn shutdown(&self) {
        tracing::debug!(server_id = %self.server_id, "closing MCP client");
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP {0}")]
    Fault(#[from] RpcFault),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),

    #[error("{0}")]
    ToolFailed(String),
}

impl From<McpError> for tm_domain::error::Error {
    fn from(e: McpError) -> Self {
        use tm_domain::error::Error;
        match e {
            McpError::Transport(TransportError::HostNotAllowed(host)) => Error::HostNotAllowed { host },
            McpError::Transport(TransportError::Timeout) => {
                Error::Timeout("MCP tool call deadline exceeded".into())
            }
            other => Error::Other(other.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::Reply;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Answers from a script keyed by method.
    pub(crate) struct ScriptedTransport {
        pub calls: Arc<Mutex<Vec<(String, Option<Value>)>>>,
        pub tool_result: Value,
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn send_request(
            &self,
            method: Method,
            params: Option<Value>,
            _timeout: Duration,
        ) -> Result<Reply, TransportError> {
            self.calls.lock().push((method.as_str().to_string(), params));
            let result = match method {
                Method::Initialize => json!({"protocolVersion": protocol::PROTOCOL_VERSION, "capabilities": {}}),
                Method::ListTools => json!({"tools": [
                    {"name": "search_issues", "description": "Search issues",
                     "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}}
                ]}),
                Method::CallTool => self.tool_result.clone(),
                Method::Initialized => Value::Null,
            };
            Ok(Reply::ok(1, result))
        }

        async fn send_notification(&self, method: Method) -> Result<(), TransportError> {
            self.calls.lock().push((method.as_str().to_string(), None));
            Ok(())
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    pub(crate) fn scripted(tool_result: Value) -> (Box<dyn McpTransport>, Arc<Mutex<Vec<(String, Option<Value>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(ScriptedTransport {
                calls: calls.clone(),
                tool_result,
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn handshake_then_tools() {
        let (transport, calls) = scripted(json!({}));
        let client = McpClient::initialize("gh", transport, Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.tools.len(), 1);
        assert_eq!(client.tools[0].name, "search_issues");
        let methods: Vec<String> = calls.lock().iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(methods, vec!["initialize", "notifications/initialized", "tools/list"]);
    }

    #[tokio::test]
    async fn call_joins_text() {
        let (transport, calls) = scripted(json!({"content": [
            {"type": "text", "text": "issue 1"},
            {"type": "text", "text": "issue 2"}
        ]}));
        let client = McpClient::initialize("gh", transport, Duration::from_secs(1)).await.unwrap();
        let out = client.call_tool("search_issues", json!({"q": "bug"})).await.unwrap();
        assert_eq!(out, "issue 1\nissue 2");
        let last = calls.lock().last().cloned().unwrap();
        assert_eq!(last.1.unwrap()["arguments"]["q"], "bug");
    }

    #[tokio::test]
    async fn error_result_is_tool_failure() {
        let (transport, _) = scripted(json!({"content": [{"type": "text", "text": "rate limited"}], "isError": true}));
        let client = McpClient::initialize("gh", transport, Duration::from_secs(1)).await.unwrap();
        let err = client.call_tool("search_issues", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
    }
}
