use crate::host::ChannelType;
use crate::tool::{ToolCatalog, ToolDefinition};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Who is asking.
#[derive(Debug, Clone, Serialize, Default)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub locale: String,
    pub timezone: String,
}

/// Where the request came from.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub kind: ChannelType,
    pub team_id: String,
    /// Direct-message channel between the requester and the bot user.
    pub is_dm_with_bot: bool,
}

/// Which bot answers.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BotSummary {
    pub user_id: String,
    pub name: String,
    pub display_name: String,
    pub custom_instructions: String,
}

/// Per-request value carried end to end: templates render against it and
/// tool resolvers receive it.
///
/// Built once per user request and read-only afterwards.
#[derive(Clone, Serialize)]
pub struct RequestContext {
    /// Correlates every log line of one request.
    pub request_id: String,
    /// Current time formatted in the requester's timezone.
    pub time: String,
    pub user: UserSummary,
    pub channel: Option<ChannelSummary>,
    pub bot: BotSummary,
    /// Free-form prompt parameters (`thread`, `since`, ...).
    pub parameters: HashMap<String, String>,
    #[serde(skip)]
    pub tools: Option<Arc<dyn ToolCatalog>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("user", &self.user.id)
            .field("channel", &self.channel.as_ref().map(|c| &c.id))
            .field("bot", &self.bot.name)
            .field("has_tools", &self.tools.is_some())
            .finish()
    }
}

impl RequestContext {
    pub fn new(user: UserSummary, bot: BotSummary) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            time: String::new(),
            user,
            channel: None,
            bot,
            parameters: HashMap::new(),
            tools: None,
        }
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    pub fn with_channel(mut self, channel: ChannelSummary) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolCatalog>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn is_dm_with_bot(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_dm_with_bot)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .as_ref()
            .map(|t| t.definitions())
            .unwrap_or_default()
    }
}
