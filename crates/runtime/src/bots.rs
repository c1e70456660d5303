//! Active bot set, access policies and bot lookup.
//!
//! The list is read on every request and replaced wholesale on reload, so
//! it sits behind a `RwLock` and readers clone the `Arc`s they need.

use crate::mention;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tm_domain::config::{AccessLevel, BotConfig, Config};
use tm_domain::context::BotSummary;
use tm_domain::error::{Error, Result};
use tm_domain::host::{Channel, ChannelType, HostClient, User};
use tm_domain::trace::TraceEvent;
use tm_providers::{LanguageModel, ModelRegistry};

/// Key-value entry remembering every bot account this process created.
const REGISTERED_BOTS_KEY: &str = "bots/registered";
const RELOAD_LOCK: &str = "bots/reload";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A configured bot bound to its platform account and language model.
pub struct Bot {
    config: BotConfig,
    user_id: String,
    model: Arc<dyn LanguageModel>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("name", &self.config.name)
            .field("user_id", &self.user_id)
            .field("provider", &self.model.provider_id())
            .finish()
    }
}

impl Bot {
    pub fn new(config: BotConfig, user_id: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            config,
            user_id: user_id.into(),
            model,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Tools are offered only when both the bot and its model allow them.
    pub fn offers_tools(&self) -> bool {
        self.config.tools_enabled() && self.model.capabilities().supports_tools
    }

    pub fn summary(&self) -> BotSummary {
        BotSummary {
            user_id: self.user_id.clone(),
            name: self.config.name.clone(),
            display_name: self.config.display_name.clone(),
            custom_instructions: self.config.custom_instructions.clone(),
        }
    }

    /// True for a direct channel between this bot and one user.
    pub fn is_dm(&self, channel: &Channel) -> bool {
        channel.kind == ChannelType::Direct && channel.name.split("__").any(|id| id == self.user_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Access policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn channel_permitted(bot: &BotConfig, channel_id: &str) -> bool {
    let listed = bot.channel_ids.iter().any(|c| c == channel_id);
    match bot.channel_access_level {
        AccessLevel::All => true,
        AccessLevel::Allow => listed,
        AccessLevel::Block => !listed,
        AccessLevel::None => false,
    }
}

pub fn user_permitted(bot: &BotConfig, user: &User) -> bool {
    let listed = bot.user_ids.iter().any(|u| u == &user.id)
        || user.team_ids.iter().any(|t| bot.team_ids.contains(t));
    match bot.user_access_level {
        AccessLevel::All => true,
        AccessLevel::Allow => listed,
        AccessLevel::Block => !listed,
        AccessLevel::None => false,
    }
}

/// Both policies must permit the request. A direct channel with the bot
/// itself is exempt from the channel policy.
pub fn check_usage(bot: &Bot, user: &User, channel: &Channel) -> Result<()> {
    if !user_permitted(bot.config(), user) {
        return Err(Error::Permission(format!(
            "user {} may not use bot {}",
            user.id,
            bot.name()
        )));
    }
    if !bot.is_dm(channel) && !channel_permitted(bot.config(), &channel.id) {
        return Err(Error::Permission(format!(
            "bot {} is not enabled in channel {}",
            bot.name(),
            channel.id
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BotManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub active: usize,
    pub skipped: usize,
    pub deactivated: usize,
}

pub struct BotManager {
    host: Arc<dyn HostClient>,
    bots: RwLock<Vec<Arc<Bot>>>,
}

impl BotManager {
    pub fn new(host: Arc<dyn HostClient>) -> Self {
        Self {
            host,
            bots: RwLock::new(Vec::new()),
        }
    }

    /// Replace the active set from `config`, taking models from `models`.
    ///
    /// Invalid bots and bots without a model are skipped. Platform accounts
    /// of bots that are no longer active are deactivated. Runs under the
    /// host's cluster lock so concurrent reloads serialize.
    pub async fn reload(&self, config: &Config, models: &ModelRegistry) -> Result<ReloadSummary> {
        self.host.lock(RELOAD_LOCK).await?;
        let result = self.reload_locked(config, models).await;
        if let Err(e) = self.host.unlock(RELOAD_LOCK).await {
            tracing::warn!(error = %e, "failed to release bot reload lock");
        }
        let summary = result?;
        TraceEvent::BotsReloaded {
            active: summary.active,
            skipped: summary.skipped,
            deactivated: summary.deactivated,
        }
        .emit();
        Ok(summary)
    }

    async fn reload_locked(&self, config: &Config, models: &ModelRegistry) -> Result<ReloadSummary> {
        let mut summary = ReloadSummary::default();

        let mut candidates: Vec<&BotConfig> = Vec::new();
        for bot in &config.bots {
            match bot.check() {
                Ok(()) => candidates.push(bot),
                Err(problem) => {
                    tracing::error!(bot = %bot.name, %problem, "invalid bot configuration, skipping");
                    summary.skipped += 1;
                }
            }
        }

        if !config.enable_multi_llm && candidates.len() > 1 {
            tracing::warn!(
                kept = %candidates[0].name,
                dropped = candidates.len() - 1,
                "multiple bots configured without multi-LLM support, only the first is active"
            );
            summary.skipped += candidates.len() - 1;
            candidates.truncate(1);
        }

        if let Some(default) = &config.default_bot {
            if let Some(pos) = candidates.iter().position(|b| &b.name == default) {
                let bot = candidates.remove(pos);
                candidates.insert(0, bot);
            }
        }

        let mut active = Vec::with_capacity(candidates.len());
        for cfg in candidates {
            let Some(model) = models.get(&cfg.name) else {
                tracing::warn!(bot = %cfg.name, "no language model for bot, skipping");
                summary.skipped += 1;
                continue;
            };
            match self.host.ensure_bot_user(&cfg.name, &cfg.display_name).await {
                Ok(user_id) => active.push(Arc::new(Bot::new(cfg.clone(), user_id, model))),
                Err(e) => {
                    tracing::warn!(bot = %cfg.name, error = %e, "failed to ensure bot user, skipping");
                    summary.skipped += 1;
                }
            }
        }

        summary.deactivated = self.deactivate_removed(&active).await?;
        summary.active = active.len();
        *self.bots.write() = active;
        Ok(summary)
    }

    /// Deactivate accounts recorded by an earlier reload that are not in
    /// `active`, then record the current set.
    async fn deactivate_removed(&self, active: &[Arc<Bot>]) -> Result<usize> {
        let previous: HashMap<String, String> = match self.host.kv_get(REGISTERED_BOTS_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring unreadable bot registry");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let current: HashMap<String, String> = active
            .iter()
            .map(|b| (b.name().to_owned(), b.user_id().to_owned()))
            .collect();
        let active_ids: HashSet<&str> = current.values().map(String::as_str).collect();

        let mut deactivated = 0;
        for (name, user_id) in &previous {
            if active_ids.contains(user_id.as_str()) {
                continue;
            }
            match self.host.deactivate_bot_user(user_id).await {
                Ok(()) => {
                    tracing::info!(bot = %name, user_id = %user_id, "deactivated removed bot");
                    deactivated += 1;
                }
                Err(e) => tracing::warn!(bot = %name, error = %e, "failed to deactivate removed bot"),
            }
        }

        self.host
            .kv_set(REGISTERED_BOTS_KEY, serde_json::to_vec(&current)?)
            .await?;
        Ok(deactivated)
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Active bots, default first.
    pub fn bots(&self) -> Vec<Arc<Bot>> {
        self.bots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.bots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.read().is_empty()
    }

    pub fn default_bot(&self) -> Option<Arc<Bot>> {
        self.bots.read().first().cloned()
    }

    pub fn get_bot(&self, name: &str) -> Option<Arc<Bot>> {
        self.bots.read().iter().find(|b| b.name() == name).cloned()
    }

    pub fn get_bot_by_user_id(&self, user_id: &str) -> Option<Arc<Bot>> {
        self.bots
            .read()
            .iter()
            .find(|b| b.user_id() == user_id)
            .cloned()
    }

    pub fn is_bot_user(&self, user_id: &str) -> bool {
        self.bots.read().iter().any(|b| b.user_id() == user_id)
    }

    pub fn bot_user_ids(&self) -> HashSet<String> {
        self.bots
            .read()
            .iter()
            .map(|b| b.user_id().to_owned())
            .collect()
    }

    /// First active bot `@mentioned` in `text` outside code.
    pub fn get_bot_mentioned(&self, text: &str) -> Option<Arc<Bot>> {
        let bots = self.bots();
        let found = mention::first_mention_of(text, bots.iter().map(|b| b.name()))?;
        bots.into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(&found))
    }

    /// The bot whose account is one side of direct channel `channel`.
    pub fn get_bot_for_dm_channel(&self, channel: &Channel) -> Option<Arc<Bot>> {
        if channel.kind != ChannelType::Direct {
            return None;
        }
        self.bots.read().iter().find(|b| b.is_dm(channel)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::MemoryHost;
    use tm_test_support::ScriptedModel;
    use tm_domain::config::{AuthConfig, ServiceConfig, ServiceKind};

    fn bot_cfg(name: &str) -> BotConfig {
        let mut service = ServiceConfig::new(ServiceKind::Openai);
        service.auth = AuthConfig::with_key("sk-test");
        BotConfig::new(name, name.to_uppercase(), service)
    }

    fn models(names: &[&str]) -> ModelRegistry {
        let mut reg = ModelRegistry::default();
        for name in names {
            reg.insert(*name, Arc::new(ScriptedModel::new()));
        }
        reg
    }

    fn config(names: &[&str]) -> Config {
        Config {
            bots: names.iter().map(|n| bot_cfg(n)).collect(),
            enable_multi_llm: true,
            ..Default::default()
        }
    }

    #[test]
    fn channel_policy_levels() {
        let mut cfg = bot_cfg("matty");
        cfg.channel_ids = vec!["c1".into()];
        assert!(channel_permitted(&cfg, "c2"));
        cfg.channel_access_level = AccessLevel::Allow;
        assert!(channel_permitted(&cfg, "c1"));
        assert!(!channel_permitted(&cfg, "c2"));
        cfg.channel_access_level = AccessLevel::Block;
        assert!(!channel_permitted(&cfg, "c1"));
        assert!(channel_permitted(&cfg, "c2"));
        cfg.channel_access_level = AccessLevel::None;
        assert!(!channel_permitted(&cfg, "c2"));
    }

    #[test]
    fn user_policy_matches_user_or_team() {
        let mut cfg = bot_cfg("matty");
        cfg.user_access_level = AccessLevel::Allow;
        cfg.user_ids = vec!["u1".into()];
        cfg.team_ids = vec!["t1".into()];

        let by_id = User {
            id: "u1".into(),
            ..Default::default()
        };
        let by_team = User {
            id: "u2".into(),
            team_ids: vec!["t1".into()],
            ..Default::default()
        };
        let stranger = User {
            id: "u3".into(),
            ..Default::default()
        };
        assert!(user_permitted(&cfg, &by_id));
        assert!(user_permitted(&cfg, &by_team));
        assert!(!user_permitted(&cfg, &stranger));

        cfg.user_access_level = AccessLevel::Block;
        assert!(!user_permitted(&cfg, &by_team));
        assert!(user_permitted(&cfg, &stranger));
    }

    #[test]
    fn dm_with_bot_skips_channel_policy() {
        let mut cfg = bot_cfg("matty");
        cfg.channel_access_level = AccessLevel::None;
        let bot = Bot::new(cfg, "bot1", Arc::new(ScriptedModel::new()));
        let user = User {
            id: "u1".into(),
            ..Default::default()
        };
        let dm = Channel {
            id: "d".into(),
            team_id: String::new(),
            kind: ChannelType::Direct,
            name: "bot1__u1".into(),
            display_name: String::new(),
        };
        let open = Channel {
            kind: ChannelType::Open,
            name: "town-square".into(),
            ..dm.clone()
        };
        assert!(check_usage(&bot, &user, &dm).is_ok());
        assert!(matches!(check_usage(&bot, &user, &open), Err(Error::Permission(_))));
    }

    #[tokio::test]
    async fn default_bot_comes_first() {
        let mgr = BotManager::new(Arc::new(MemoryHost::new()));
        let mut cfg = config(&["a", "b", "c"]);
        cfg.default_bot = Some("c".into());
        mgr.reload(&cfg, &models(&["a", "b", "c"])).await.unwrap();

        let names: Vec<_> = mgr.bots().iter().map(|b| b.name().to_owned()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(mgr.default_bot().unwrap().name(), "c");
    }

    #[tokio::test]
    async fn without_multi_llm_only_first_is_active() {
        let mgr = BotManager::new(Arc::new(MemoryHost::new()));
        let mut cfg = config(&["a", "b"]);
        cfg.enable_multi_llm = false;
        let summary = mgr.reload(&cfg, &models(&["a", "b"])).await.unwrap();
        assert_eq!(summary.active, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(mgr.bots()[0].name(), "a");
    }

    #[tokio::test]
    async fn invalid_and_modelless_bots_are_skipped() {
        let mgr = BotManager::new(Arc::new(MemoryHost::new()));
        let mut cfg = config(&["a", "b"]);
        cfg.bots.push(BotConfig::new("broken", "", ServiceConfig::new(ServiceKind::Openai)));
        let summary = mgr.reload(&cfg, &models(&["a"])).await.unwrap();
        assert_eq!(summary.active, 1);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn removed_bots_are_deactivated_not_deleted() {
        let host = Arc::new(MemoryHost::new());
        let mgr = BotManager::new(host.clone());
        mgr.reload(&config(&["a", "b"]), &models(&["a", "b"]))
            .await
            .unwrap();
        let b_id = mgr.get_bot("b").unwrap().user_id().to_owned();

        let summary = mgr.reload(&config(&["a"]), &models(&["a"])).await.unwrap();
        assert_eq!(summary.deactivated, 1);
        assert!(host.is_deactivated(&b_id));
        assert!(host.get_user(&b_id).await.is_ok());
        assert!(mgr.get_bot("b").is_none());

        // Reloading again has nothing left to deactivate.
        let summary = mgr.reload(&config(&["a"]), &models(&["a"])).await.unwrap();
        assert_eq!(summary.deactivated, 0);
    }

    #[tokio::test]
    async fn lookup_by_mention_and_dm() {
        let host = Arc::new(MemoryHost::new());
        let mgr = BotManager::new(host.clone());
        mgr.reload(&config(&["matty", "gpt"]), &models(&["matty", "gpt"]))
            .await
            .unwrap();
        let matty = mgr.get_bot("matty").unwrap();

        assert_eq!(mgr.get_bot_mentioned("hey @matty").unwrap().name(), "matty");
        assert!(mgr.get_bot_mentioned("hey `@matty`").is_none());
        assert!(mgr.get_bot_mentioned("hey @alice").is_none());

        let dm = host.get_direct_channel(matty.user_id(), "u1").await.unwrap();
        assert_eq!(mgr.get_bot_for_dm_channel(&dm).unwrap().name(), "matty");
        assert!(mgr.is_bot_user(matty.user_id()));
        assert!(!mgr.is_bot_user("u1"));
    }
}
