//! Provider factory and registry.
//!
//! Builds one [`LanguageModel`] per bot from its service config. Every model
//! is wrapped in [`TruncatingModel`], so callers never see an unbounded
//! conversation reach a provider.

use crate::anthropic::AnthropicProvider;
use crate::asksage::AskSageProvider;
use crate::bedrock::BedrockProvider;
use crate::network::AllowedHosts;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LanguageModel;
use crate::truncation::TruncatingModel;
use std::collections::HashMap;
use std::sync::Arc;
use tm_domain::config::{BotConfig, Config, ServiceConfig, ServiceKind};
use tm_domain::error::Result;

/// Process-wide inputs every adapter needs.
#[derive(Clone)]
pub struct ProviderEnv {
    pub allowed_hosts: Arc<AllowedHosts>,
    /// Inter-event timeout for services that do not set their own.
    pub default_streaming_timeout_secs: u64,
}

impl ProviderEnv {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_hosts: Arc::new(AllowedHosts::new(
                &config.network.allowed_upstream_hostnames,
            )),
            default_streaming_timeout_secs: config.streaming.inactivity_timeout_secs,
        }
    }
}

impl std::fmt::Debug for ProviderEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEnv")
            .field(
                "default_streaming_timeout_secs",
                &self.default_streaming_timeout_secs,
            )
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the adapter for `cfg` and wrap it in the truncation layer.
///
/// A base URL outside the allow-list does not fail construction: the bot
/// still loads and every completion ends with a host-not-allowed error
/// event, without any request leaving the process.
pub fn build_model(
    id: &str,
    cfg: &ServiceConfig,
    env: &ProviderEnv,
) -> Result<Arc<dyn LanguageModel>> {
    let model: Arc<dyn LanguageModel> = match cfg.kind {
        ServiceKind::Openai | ServiceKind::OpenaiCompatible | ServiceKind::Azure => {
            Arc::new(OpenAiCompatProvider::from_config(id, cfg, env)?)
        }
        ServiceKind::Anthropic => Arc::new(AnthropicProvider::from_config(id, cfg, env)?),
        ServiceKind::Bedrock => Arc::new(BedrockProvider::from_config(id, cfg, env)?),
        ServiceKind::Asksage => Arc::new(AskSageProvider::from_config(id, cfg, env)?),
    };

    if let Some(url) = cfg.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
        if let Err(e) = env.allowed_hosts.check_url(url) {
            tracing::warn!(
                bot = %id,
                kind = %cfg.kind,
                error = %e,
                "service endpoint is blocked; completions for this bot will fail"
            );
        }
    }

    Ok(Arc::new(TruncatingModel::new(model)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ModelRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Models keyed by bot name.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn LanguageModel>>,
}

impl ModelRegistry {
    /// Build a model for each bot.
    ///
    /// Bots whose model fails to initialize are logged and skipped rather
    /// than aborting the whole load.
    pub fn from_bots(bots: &[BotConfig], env: &ProviderEnv) -> Self {
        let mut models = HashMap::new();
        for bot in bots {
            match build_model(&bot.name, &bot.service, env) {
                Ok(model) => {
                    tracing::info!(
                        bot = %bot.name,
                        kind = %bot.service.kind,
                        "registered language model"
                    );
                    models.insert(bot.name.clone(), model);
                }
                Err(e) => {
                    tracing::warn!(
                        bot = %bot.name,
                        kind = %bot.service.kind,
                        error = %e,
                        "failed to initialize language model, skipping bot"
                    );
                }
            }
        }
        Self { models }
    }

    pub fn insert(&mut self, bot: impl Into<String>, model: Arc<dyn LanguageModel>) {
        self.models.insert(bot.into(), model);
    }

    pub fn get(&self, bot: &str) -> Option<Arc<dyn LanguageModel>> {
        self.models.get(bot).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Bot names with a model (sorted).
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::config::AuthConfig;

    fn env(hosts: &[&str]) -> ProviderEnv {
        ProviderEnv {
            allowed_hosts: Arc::new(AllowedHosts::new(hosts.iter().copied())),
            default_streaming_timeout_secs: 10,
        }
    }

    fn bot(name: &str, kind: ServiceKind) -> BotConfig {
        let mut service = ServiceConfig::new(kind);
        service.auth = AuthConfig::with_key("sk-test");
        BotConfig::new(name, name, service)
    }

    #[test]
    fn builds_each_kind() {
        let mut compat = bot("compat", ServiceKind::OpenaiCompatible);
        compat.service.api_url = Some("http://localhost:8080/v1".into());
        let mut bedrock = bot("bedrock", ServiceKind::Bedrock);
        bedrock.service.default_model = "anthropic.claude-3-haiku".into();
        let mut asksage = bot("sage", ServiceKind::Asksage);
        asksage.service.username = Some("me@example.com".into());

        let bots = vec![
            bot("openai", ServiceKind::Openai),
            compat,
            bot("claude", ServiceKind::Anthropic),
            bedrock,
            asksage,
        ];
        let registry = ModelRegistry::from_bots(&bots, &env(&["*"]));
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("sage").unwrap().input_token_limit(), 4096);
        assert_eq!(registry.get("claude").unwrap().input_token_limit(), 200_000);
    }

    #[test]
    fn broken_bots_are_skipped() {
        // Azure without api_url cannot be built.
        let bots = vec![bot("ok", ServiceKind::Openai), bot("bad", ServiceKind::Azure)];
        let registry = ModelRegistry::from_bots(&bots, &env(&["*"]));
        assert_eq!(registry.list(), vec!["ok".to_string()]);
    }

    #[test]
    fn blocked_endpoint_still_builds() {
        let mut b = bot("evil", ServiceKind::OpenaiCompatible);
        b.service.api_url = Some("https://evil.example/".into());
        assert!(build_model(&b.name, &b.service, &env(&["api.openai.com"])).is_ok());
    }
}
