use serde::{Deserialize, Serialize};

/// Outbound HTTP restrictions for LLM and tool-server traffic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    /// Exact hostnames, `*.suffix` wildcards, or `*` for everything.
    #[serde(default)]
    pub allowed_upstream_hostnames: Vec<String>,
}
