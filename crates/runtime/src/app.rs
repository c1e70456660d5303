//! Runtime construction and teardown.
//!
//! Everything process-wide (bot list, per-user tool clients, live streams)
//! is created here once and torn down by [`Runtime::shutdown`].

use crate::bots::{BotManager, ReloadSummary};
use crate::context::ContextBuilder;
use crate::meta::KvPostMetaStore;
use crate::orchestrator::Orchestrator;
use crate::service::Conversations;
use crate::streams::StreamContexts;
use crate::writer::StreamWriter;
use anyhow::Context;
use std::sync::Arc;
use tm_domain::config::{Config, ConfigSeverity};
use tm_domain::host::HostClient;
use tm_mcp_client::UserClientManager;
use tm_prompts::Prompts;
use tm_providers::{ModelRegistry, ProviderEnv};
use tm_tools::LogTraceSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Runtime {
    pub config: Arc<Config>,
    pub host: Arc<dyn HostClient>,
    pub bots: Arc<BotManager>,
    pub streams: Arc<StreamContexts>,
    pub conversations: Arc<Conversations>,
    env: ProviderEnv,
    mcp: Option<Arc<UserClientManager>>,
    shutdown: CancellationToken,
    reaper: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Build the runtime with one language model per configured bot.
    pub async fn build(config: Arc<Config>, host: Arc<dyn HostClient>) -> anyhow::Result<Self> {
        let env = ProviderEnv::from_config(&config);
        let models = ModelRegistry::from_bots(&config.bots, &env);
        Self::build_with_models(config, host, models).await
    }

    /// Build the runtime around models supplied by the caller.
    pub async fn build_with_models(
        config: Arc<Config>,
        host: Arc<dyn HostClient>,
        models: ModelRegistry,
    ) -> anyhow::Result<Self> {
        // ── Config validation ────────────────────────────────────────────
        // Bot problems only disable the bot; anything else stops startup.
        let issues = config.validate();
        let mut fatal = 0;
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                ConfigSeverity::Error => {
                    tracing::error!("config: {issue}");
                    if !issue.field.starts_with("bots[") {
                        fatal += 1;
                    }
                }
            }
        }
        if fatal > 0 {
            anyhow::bail!("config validation failed with {fatal} error(s)");
        }

        let env = ProviderEnv::from_config(&config);

        // ── Prompts ──────────────────────────────────────────────────────
        let prompts = Arc::new(Prompts::from_config(&config.prompts).context("loading prompt templates")?);

        // ── Per-user tool clients ────────────────────────────────────────
        let shutdown = CancellationToken::new();
        let mut reaper = None;
        let mcp = if config.mcp.enabled {
            let manager = Arc::new(
                UserClientManager::new(config.mcp.clone(), env.allowed_hosts.clone())
                    .context("initializing MCP client manager")?,
            );
            reaper = Some(manager.clone().spawn_reaper(shutdown.clone()));
            tracing::info!(servers = config.mcp.servers.len(), "MCP tool servers enabled");
            Some(manager)
        } else {
            None
        };

        // ── Bots ─────────────────────────────────────────────────────────
        let bots = Arc::new(BotManager::new(host.clone()));
        let summary = bots.reload(&config, &models).await.context("loading bots")?;
        tracing::info!(
            active = summary.active,
            skipped = summary.skipped,
            deactivated = summary.deactivated,
            "bots loaded"
        );

        // ── Conversations ────────────────────────────────────────────────
        let streams = Arc::new(StreamContexts::new());
        let orchestrator = Arc::new(Orchestrator::new(
            host.clone(),
            bots.clone(),
            prompts,
            Arc::new(KvPostMetaStore::new(host.clone())),
        ));
        let writer = Arc::new(StreamWriter::new(
            host.clone(),
            streams.clone(),
            config.streaming.clone(),
        ));
        let contexts = ContextBuilder::new(host.clone(), mcp.clone(), Arc::new(LogTraceSink));
        let conversations = Arc::new(Conversations::new(
            host.clone(),
            bots.clone(),
            orchestrator,
            contexts,
            writer,
        ));

        Ok(Self {
            config,
            host,
            bots,
            streams,
            conversations,
            env,
            mcp,
            shutdown,
            reaper,
        })
    }

    /// Swap in the bots of `config`, building fresh models for them.
    pub async fn reload_bots(&self, config: &Config) -> tm_domain::error::Result<ReloadSummary> {
        let models = ModelRegistry::from_bots(&config.bots, &self.env);
        self.bots.reload(config, &models).await
    }

    /// Stop background tasks, cancel live streams and close tool clients.
    pub async fn shutdown(self) {
        tracing::info!(live_streams = self.streams.len(), "runtime shutting down");
        self.shutdown.cancel();
        if let Some(reaper) = self.reaper {
            if let Err(e) = reaper.await {
                tracing::warn!(error = %e, "MCP reaper task failed");
            }
        }
        if let Some(mcp) = &self.mcp {
            mcp.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::MemoryHost;
    use tm_test_support::ScriptedModel;
    use tm_domain::config::{AuthConfig, BotConfig, ServiceConfig, ServiceKind};

    fn bot(name: &str) -> BotConfig {
        let mut service = ServiceConfig::new(ServiceKind::Openai);
        service.auth = AuthConfig::with_key("sk-test");
        BotConfig::new(name, name, service)
    }

    #[tokio::test]
    async fn invalid_bots_do_not_stop_startup() {
        let config = Config {
            bots: vec![bot("matty"), bot("")],
            enable_multi_llm: true,
            ..Default::default()
        };
        let mut models = ModelRegistry::default();
        models.insert("matty", Arc::new(ScriptedModel::new()));

        let rt = Runtime::build_with_models(Arc::new(config), Arc::new(MemoryHost::new()), models)
            .await
            .unwrap();
        assert_eq!(rt.bots.len(), 1);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn other_config_errors_are_fatal() {
        let mut config = Config::default();
        config.streaming.flush_interval_ms = 0;
        let result = Runtime::build_with_models(
            Arc::new(config),
            Arc::new(MemoryHost::new()),
            ModelRegistry::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reload_swaps_bots() {
        let config = Config {
            bots: vec![bot("matty")],
            ..Default::default()
        };
        let mut models = ModelRegistry::default();
        models.insert("matty", Arc::new(ScriptedModel::new()));
        let rt = Runtime::build_with_models(Arc::new(config), Arc::new(MemoryHost::new()), models)
            .await
            .unwrap();

        let summary = rt.reload_bots(&Config::default()).await.unwrap();
        assert_eq!(summary.active, 0);
        assert_eq!(summary.deactivated, 1);
        assert!(rt.bots.is_empty());
        rt.shutdown().await;
    }
}
