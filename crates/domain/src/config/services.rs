use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream LLM service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Openai,
    OpenaiCompatible,
    Azure,
    Anthropic,
    Bedrock,
    Asksage,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Openai => "openai",
            ServiceKind::OpenaiCompatible => "openai-compatible",
            ServiceKind::Azure => "azure",
            ServiceKind::Anthropic => "anthropic",
            ServiceKind::Bedrock => "bedrock",
            ServiceKind::Asksage => "asksage",
        }
    }

    /// Input budget used when the service config names none.
    pub fn default_input_token_limit(self) -> u32 {
        match self {
            ServiceKind::Openai | ServiceKind::OpenaiCompatible | ServiceKind::Azure => 128_000,
            ServiceKind::Anthropic | ServiceKind::Bedrock => 200_000,
            ServiceKind::Asksage => 4_096,
        }
    }

    pub fn default_output_token_limit(self) -> u32 {
        match self {
            ServiceKind::Anthropic => 4_096,
            _ => 8_192,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Base URL. Required for `openai-compatible` and `azure`; the other
    /// kinds fall back to the vendor endpoint.
    #[serde(default)]
    pub api_url: Option<String>,
    /// API key (or AskSage password) source.
    #[serde(default)]
    pub auth: AuthConfig,
    /// AskSage account email.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    /// Bedrock region.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub input_token_limit: Option<u32>,
    #[serde(default)]
    pub output_token_limit: Option<u32>,
    /// Legacy single limit. Read as the input limit.
    #[serde(default)]
    pub token_limit: Option<u32>,
    /// Maximum silence between two streamed events.
    #[serde(default)]
    pub streaming_timeout_secs: Option<u64>,
    /// Forward the requesting user's id to the vendor (`user` field).
    #[serde(default)]
    pub send_user_id: bool,
}

impl ServiceConfig {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            api_url: None,
            auth: AuthConfig::default(),
            username: None,
            org_id: None,
            region: None,
            default_model: String::new(),
            input_token_limit: None,
            output_token_limit: None,
            token_limit: None,
            streaming_timeout_secs: None,
            send_user_id: false,
        }
    }

    pub fn input_limit(&self) -> u32 {
        self.input_token_limit
            .or(self.token_limit)
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.kind.default_input_token_limit())
    }

    pub fn output_limit(&self) -> u32 {
        self.output_token_limit
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.kind.default_output_token_limit())
    }

    pub fn streaming_timeout(&self, fallback_secs: u64) -> Duration {
        Duration::from_secs(
            self.streaming_timeout_secs
                .filter(|s| *s > 0)
                .unwrap_or(fallback_secs),
        )
    }

    fn has_api_url(&self) -> bool {
        self.api_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Why this service cannot be used, if it cannot.
    pub fn credential_problem(&self) -> Option<&'static str> {
        match self.kind {
            ServiceKind::OpenaiCompatible | ServiceKind::Azure if !self.has_api_url() => {
                Some("api_url is required")
            }
            ServiceKind::OpenaiCompatible | ServiceKind::Azure => None,
            ServiceKind::Asksage => {
                if self.username.as_deref().map_or(true, str::is_empty) || !self.auth.is_configured()
                {
                    Some("username and password are required")
                } else {
                    None
                }
            }
            ServiceKind::Openai | ServiceKind::Anthropic | ServiceKind::Bedrock => {
                if self.auth.is_configured() {
                    None
                } else {
                    Some("api key is required")
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Header name (e.g. "Authorization", "x-api-key").
    #[serde(default)]
    pub header: Option<String>,
    /// Header value prefix (e.g. "Bearer ").
    #[serde(default)]
    pub prefix: Option<String>,
    /// Env var containing the key.
    #[serde(default)]
    pub env: Option<String>,
    /// Direct key (for config-only setups; prefer env or the keychain).
    #[serde(default)]
    pub key: Option<String>,
    /// Keychain service name (e.g., "threadmind").
    #[serde(default)]
    pub service: Option<String>,
    /// Keychain account name (e.g., "openai-api-key").
    #[serde(default)]
    pub account: Option<String>,
}

impl AuthConfig {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// True when at least one credential source is named. Whether the
    /// source actually yields a key is only known at resolution time.
    pub fn is_configured(&self) -> bool {
        let set = |o: &Option<String>| o.as_deref().is_some_and(|s| !s.is_empty());
        set(&self.key) || set(&self.env) || (set(&self.service) && set(&self.account))
    }
}
