//! Remote tool-server (MCP) configuration.
//!
//! Only the `[mcp]` section shape lives here; connection handling is in the
//! `tm-mcp-client` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Per-user clients idle longer than this are closed.
    #[serde(default = "d_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deadline for one remote tool call.
    #[serde(default = "d_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: Vec::new(),
            idle_timeout_secs: d_idle_timeout_secs(),
            call_timeout_secs: d_call_timeout_secs(),
        }
    }
}

/// One SSE tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    /// SSE endpoint, e.g. `https://tools.example.com/sse`.
    pub url: String,
    /// Extra headers sent with every request to this server.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn d_idle_timeout_secs() -> u64 {
    30 * 60
}

fn d_call_timeout_secs() -> u64 {
    5 * 60
}
