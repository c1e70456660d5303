mod bots;
mod mcp;
mod network;
mod observability;
mod prompts;
mod services;
mod streaming;

pub use bots::*;
pub use mcp::*;
pub use network::*;
pub use observability::*;
pub use prompts::*;
pub use services::*;
pub use streaming::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bots: Vec<BotConfig>,
    /// Name of the bot listed first and used when none is mentioned.
    #[serde(default)]
    pub default_bot: Option<String>,
    /// When false only the first configured bot is active.
    #[serde(default)]
    pub enable_multi_llm: bool,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Invalid bots are reported as errors but do not stop startup; the bot
    /// manager skips them.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.bots.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "bots".into(),
                message: "no bots configured".into(),
            });
        }

        let mut seen = HashSet::new();
        for (i, bot) in self.bots.iter().enumerate() {
            if let Err(message) = bot.check() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("bots[{i}]"),
                    message,
                });
            }
            if !bot.name.is_empty() && !seen.insert(bot.name.as_str()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("bots[{i}].name"),
                    message: format!("duplicate bot name {:?}", bot.name),
                });
            }
        }

        if let Some(default) = &self.default_bot {
            if !self.bots.iter().any(|b| &b.name == default) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "default_bot".into(),
                    message: format!("default bot {default:?} is not configured"),
                });
            }
        }

        if self.bots.len() > 1 && !self.enable_multi_llm {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "enable_multi_llm".into(),
                message: "multiple bots configured but only the first will be active".into(),
            });
        }

        if self.network.allowed_upstream_hostnames.is_empty() && !self.bots.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "network.allowed_upstream_hostnames".into(),
                message: "empty allow-list blocks every upstream request".into(),
            });
        }

        if self.streaming.flush_interval_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "streaming.flush_interval_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        let mut server_ids = HashSet::new();
        for (i, server) in self.mcp.servers.iter().enumerate() {
            if server.id.is_empty() || !server_ids.insert(server.id.as_str()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].id"),
                    message: "server id must be non-empty and unique".into(),
                });
            }
            if !(server.url.starts_with("http://") || server.url.starts_with("https://")) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].url"),
                    message: "url must be http(s)".into(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "observability.sample_rate".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        errors
    }

    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error)
    }
}
