use super::services::ServiceConfig;
use serde::{Deserialize, Serialize};

/// Four-valued access policy shared by channel and user checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    All,
    Allow,
    Block,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Username of the bot's platform account.
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub custom_instructions: String,
    pub service: ServiceConfig,
    #[serde(default)]
    pub enable_vision: bool,
    #[serde(default)]
    pub disable_tools: bool,
    #[serde(default)]
    pub channel_access_level: AccessLevel,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub user_access_level: AccessLevel,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub team_ids: Vec<String>,
    /// Largest number of bytes read from one attached file.
    #[serde(default = "d_max_file_size")]
    pub max_file_size: u64,
}

impl BotConfig {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, service: ServiceConfig) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            custom_instructions: String::new(),
            service,
            enable_vision: false,
            disable_tools: false,
            channel_access_level: AccessLevel::All,
            channel_ids: Vec::new(),
            user_access_level: AccessLevel::All,
            user_ids: Vec::new(),
            team_ids: Vec::new(),
            max_file_size: d_max_file_size(),
        }
    }

    /// A bot is usable iff its identity is complete and its service has the
    /// credentials its kind needs.
    pub fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.display_name.trim().is_empty() {
            return Err(format!("bot {}: display_name must not be empty", self.name));
        }
        if let Some(problem) = self.service.credential_problem() {
            return Err(format!(
                "bot {} ({}): {problem}",
                self.name, self.service.kind
            ));
        }
        Ok(())
    }

    pub fn tools_enabled(&self) -> bool {
        !self.disable_tools
    }
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

fn d_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, ServiceKind};

    fn openai() -> ServiceConfig {
        let mut s = ServiceConfig::new(ServiceKind::Openai);
        s.auth = AuthConfig::with_key("sk-test");
        s
    }

    #[test]
    fn complete_bot_is_usable() {
        assert!(BotConfig::new("matty", "Matty", openai()).check().is_ok());
    }

    #[test]
    fn missing_display_name_rejected() {
        let err = BotConfig::new("matty", " ", openai()).check().unwrap_err();
        assert!(err.contains("display_name"));
    }

    #[test]
    fn missing_key_rejected() {
        let bot = BotConfig::new("matty", "Matty", ServiceConfig::new(ServiceKind::Anthropic));
        assert!(bot.check().unwrap_err().contains("api key"));
    }

    #[test]
    fn defaults_from_toml() {
        let bot: BotConfig = toml::from_str(
            r#"
name = "matty"
display_name = "Matty"
[service]
type = "openai"
"#,
        )
        .unwrap();
        assert_eq!(bot.channel_access_level, AccessLevel::All);
        assert_eq!(bot.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(bot.tools_enabled());
    }
}
