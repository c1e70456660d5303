//! Per-user MCP clients.
//!
//! Remote tool servers act on behalf of a user, so each (user, server) pair
//! gets its own session. Sessions are opened on first use, cached, and
//! closed after a quiet period by [`UserClientManager::spawn_reaper`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tm_domain::config::McpConfig;
use tm_domain::context::RequestContext;
use tm_domain::error::Result;
use tm_domain::trace::TraceEvent;
use tm_providers::network::{guarded_client, AllowedHosts};
use tm_tools::{Tool, ToolArgs, ToolResolver, ToolStore};

use crate::client::McpClient;

/// Longest pause between idle sweeps.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// One user's sessions, plus when they were last used.
struct UserClients {
    clients: Vec<Arc<McpClient>>,
    last_activity: Mutex<Instant>,
}

impl UserClients {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

pub struct UserClientManager {
    config: McpConfig,
    allowed: Arc<AllowedHosts>,
    http: reqwest::Client,
    users: Mutex<HashMap<String, Arc<UserClients>>>,
    opening: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserClientManager {
    pub fn new(config: McpConfig, allowed: Arc<AllowedHosts>) -> Result<Self> {
        let http = guarded_client(allowed.clone())?;
        Ok(Self {
            config,
            allowed,
            http,
            users: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.servers.is_empty()
    }

    /// Number of users with open sessions.
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    /// Cached sessions for `user_id` when every one of them is still usable.
    fn cached(&self, user_id: &str) -> Option<Arc<UserClients>> {
        let existing = self.users.lock().get(user_id).cloned()?;
        if existing.clients.iter().all(|c| c.is_alive()) {
            existing.touch();
            Some(existing)
        } else {
            None
        }
    }

    /// The user's sessions, opening them if needed.
    ///
    /// Concurrent first uses for one user wait on a per-user gate so only one
    /// of them connects. Servers that fail to connect are logged and skipped;
    /// when none connect nothing is cached and the next use tries again.
    /// Replaced sessions are not shut down: in-flight tool calls may still
    /// hold them, and the transport closes when the last handle drops.
    async fn clients_for(&self, user_id: &str) -> Arc<UserClients> {
        if let Some(sessions) = self.cached(user_id) {
            return sessions;
        }

        let gate = self
            .opening
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let _opening = gate.lock().await;
        if let Some(sessions) = self.cached(user_id) {
            return sessions;
        }

        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);
        let mut clients = Vec::new();
        for server in &self.config.servers {
            match McpClient::connect(server, user_id, self.http.clone(), self.allowed.clone(), call_timeout).await {
                Ok(client) => {
                    TraceEvent::McpClientConnected {
                        user_id: user_id.to_string(),
                        server_id: server.id.clone(),
                        tools: client.tools.len(),
                    }
                    .emit();
                    clients.push(Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %server.id,
                        user = %user_id,
                        error = %e,
                        "failed to connect MCP server, skipping"
                    );
                }
            }
        }

        let fresh = Arc::new(UserClients {
            clients,
            last_activity: Mutex::new(Instant::now()),
        });
        if fresh.clients.is_empty() {
            self.users.lock().remove(user_id);
        } else {
            self.users.lock().insert(user_id.to_string(), fresh.clone());
        }
        fresh
    }

    /// Tool descriptors for every tool the user's servers expose.
    ///
    /// When two servers expose the same name the later server wins.
    pub async fn tools_for_user(&self, user_id: &str) -> Vec<Tool> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let sessions = self.clients_for(user_id).await;

        let mut by_name: HashMap<String, Tool> = HashMap::new();
        for client in &sessions.clients {
            for def in &client.tools {
                if by_name.contains_key(&def.name) {
                    tracing::warn!(
                        tool = %def.name,
                        server_id = %client.server_id,
                        "MCP tool name collision, later server wins"
                    );
                }
                let resolver = RemoteTool {
                    client: client.clone(),
                    sessions: sessions.clone(),
                    tool: def.name.clone(),
                };
                by_name.insert(
                    def.name.clone(),
                    Tool::new(def.name.clone(), def.description.clone(), def.input_schema.clone(), resolver),
                );
            }
        }
        let mut tools: Vec<Tool> = by_name.into_values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Add the user's remote tools to `store`.
    pub async fn register_tools(&self, store: &ToolStore, user_id: &str) {
        let tools = self.tools_for_user(user_id).await;
        if !tools.is_empty() {
            tracing::debug!(user = %user_id, count = tools.len(), "registering MCP tools");
            store.add_tools(tools);
        }
    }

    /// Close sessions idle longer than the configured timeout.
    pub async fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now()).await
    }

    async fn reap_idle_at(&self, now: Instant) -> usize {
        let idle_limit = Duration::from_secs(self.config.idle_timeout_secs);
        let expired: Vec<(String, Arc<UserClients>)> = {
            let mut users = self.users.lock();
            let ids: Vec<String> = users
                .iter()
                .filter(|(_, s)| s.idle_for(now) > idle_limit)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| users.remove(&id).map(|s| (id, s)))
                .collect()
        };
        {
            let mut opening = self.opening.lock();
            for (user_id, _) in &expired {
                opening.remove(user_id);
            }
        }

        for (user_id, sessions) in &expired {
            let idle_secs = sessions.idle_for(now).as_secs();
            for client in &sessions.clients {
                client.shutdown().await;
                TraceEvent::McpClientReaped {
                    user_id: user_id.clone(),
                    server_id: client.server_id.clone(),
                    idle_secs,
                }
                .emit();
            }
        }
        expired.len()
    }

    /// Sweep for idle sessions until `cancel` fires.
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let every = (Duration::from_secs(self.config.idle_timeout_secs) / 2)
            .clamp(Duration::from_secs(1), MAX_REAP_INTERVAL);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = self.reap_idle().await;
                        if reaped > 0 {
                            tracing::debug!(reaped, "closed idle MCP sessions");
                        }
                    }
                }
            }
        })
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        self.opening.lock().clear();
        let all: Vec<Arc<UserClients>> = self.users.lock().drain().map(|(_, s)| s).collect();
        for sessions in all {
            for client in &sessions.clients {
                client.shutdown().await;
            }
        }
    }

    #[cfg(test)]
    fn insert_sessions(&self, user_id: &str, clients: Vec<Arc<McpClient>>, last_activity: Instant) {
        self.users.lock().insert(
            user_id.to_string(),
            Arc::new(UserClients {
                clients,
                last_activity: Mutex::new(last_activity),
            }),
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Remote tool resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RemoteTool {
    client: Arc<McpClient>,
    sessions: Arc<UserClients>,
    tool: String,
}

#[async_trait::async_trait]
impl ToolResolver for RemoteTool {
    async fn call(&self, ctx: &RequestContext, args: ToolArgs) -> Result<String> {
        self.sessions.touch();
        tracing::debug!(
            tool = %self.tool,
            server_id = %self.client.server_id,
            request_id = %ctx.request_id,
            "calling MCP tool"
        );
        // The server validates against its own schema.
        let arguments: Value = args.raw().clone();
        let out = self.client.call_tool(&self.tool, arguments).await?;
        self.sessions.touch();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::scripted;
    use serde_json::json;
    use tm_domain::config::McpServerConfig;
    use tm_domain::context::{BotSummary, UserSummary};

    fn config(idle_secs: u64) -> McpConfig {
        McpConfig {
            enabled: true,
            servers: vec![McpServerConfig {
                id: "gh".into(),
                url: "https://tools.example.com/sse".into(),
                headers: HashMap::new(),
            }],
            idle_timeout_secs: idle_secs,
            call_timeout_secs: 300,
        }
    }

    async fn client(result: Value) -> Arc<McpClient> {
        let (transport, _) = scripted(result);
        Arc::new(McpClient::initialize("gh", transport, Duration::from_secs(1)).await.unwrap())
    }

    fn manager(idle_secs: u64) -> UserClientManager {
        UserClientManager::new(config(idle_secs), Arc::new(AllowedHosts::allow_all())).unwrap()
    }

    #[tokio::test]
    async fn cached_sessions_become_tools() {
        let mgr = manager(1800);
        mgr.insert_sessions("u1", vec![client(json!({"content": [{"type": "text", "text": "found"}]})).await], Instant::now());

        let store = ToolStore::new();
        mgr.register_tools(&store, "u1").await;
        assert_eq!(store.names(), vec!["search_issues"]);

        let ctx = RequestContext::new(UserSummary::default(), BotSummary::default());
        let out = store.resolve_tool("search_issues", json!({"q": "x"}), &ctx).await.unwrap();
        assert_eq!(out, "found");
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let mgr = manager(60);
        let now = Instant::now();
        mgr.insert_sessions("stale", vec![client(json!({})).await], now);
        mgr.insert_sessions("fresh", vec![client(json!({})).await], now + Duration::from_secs(100));

        let reaped = mgr.reap_idle_at(now + Duration::from_secs(120)).await;
        assert_eq!(reaped, 1);
        assert_eq!(mgr.user_count(), 1);
        assert!(mgr.users.lock().contains_key("fresh"));
    }

    #[tokio::test]
    async fn disabled_manager_offers_nothing() {
        let mut cfg = config(60);
        cfg.enabled = false;
        let mgr = UserClientManager::new(cfg, Arc::new(AllowedHosts::allow_all())).unwrap();
        assert!(mgr.tools_for_user("u1").await.is_empty());
        assert_eq!(mgr.user_count(), 0);
    }
}
