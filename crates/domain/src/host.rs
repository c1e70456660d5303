//! Boundary to the chat platform that hosts the bots.
//!
//! The runtime only ever talks to the platform through [`HostClient`]; the
//! value types here are the subset of platform records it reads or writes.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Post property keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod props {
    pub const REFERENCED_THREAD: &str = "referenced_thread";
    pub const REFERENCED_TRANSCRIPT: &str = "referenced_transcript_post_id";
    pub const PROMPT_TYPE: &str = "prompt_type";
    pub const RESPONDING_TO: &str = "responding_to";
    pub const PENDING_TOOL_CALLS: &str = "pending_tool_calls";
    /// Earlier approval rounds of a bot post, oldest first.
    pub const RESOLVED_TOOL_CALLS: &str = "resolved_tool_calls";
    pub const REQUESTER: &str = "llm_requester_user_id";
    pub const NO_REGEN: &str = "no_regen";
    pub const FROM_PLUGIN: &str = "from_plugin";
    pub const FROM_WEBHOOK: &str = "from_webhook";
    pub const FROM_BOT: &str = "from_bot";
    pub const ACTIVATE_AI: &str = "activate_ai";
    pub const WRANGLER: &str = "wrangler";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Value types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub locale: String,
    /// IANA zone name, e.g. `Europe/Paris`.
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub team_ids: Vec<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Open,
    Private,
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    pub kind: ChannelType,
    /// For direct channels: `<user_a>__<user_b>`.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentField {
    pub title: String,
    pub value: String,
}

/// Structured message attachment as posted by integrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachment {
    #[serde(default)]
    pub pretext: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub fields: Vec<AttachmentField>,
    #[serde(default)]
    pub footer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostPost {
    #[serde(default)]
    pub id: String,
    /// Empty for thread roots.
    #[serde(default)]
    pub root_id: String,
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub message: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
    #[serde(default)]
    pub props: Map<String, Value>,
    /// Set when the post was federated from another server.
    #[serde(default)]
    pub remote_id: Option<String>,
}

impl HostPost {
    /// Id of the thread this post belongs to.
    pub fn thread_root(&self) -> &str {
        if self.root_id.is_empty() {
            &self.id
        } else {
            &self.root_id
        }
    }

    pub fn is_reply(&self) -> bool {
        !self.root_id.is_empty()
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn has_prop(&self, key: &str) -> bool {
        self.props.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Boolean props arrive as JSON booleans or as `"true"` strings.
    pub fn prop_bool(&self, key: &str) -> bool {
        match self.props.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn set_prop(&mut self, key: &str, value: impl Into<Value>) {
        self.props.insert(key.to_owned(), value.into());
    }

    pub fn remove_prop(&mut self, key: &str) {
        self.props.remove(key);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Text the platform already extracted from the file, if any.
    #[serde(default)]
    pub extracted_content: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operations the runtime needs from the chat platform.
///
/// Logging goes through `tracing` and configuration through
/// [`crate::config::Config`], so neither appears here.
#[async_trait::async_trait]
pub trait HostClient: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User>;
    async fn get_user_by_username(&self, username: &str) -> Result<User>;
    async fn get_channel(&self, channel_id: &str) -> Result<Channel>;
    /// Direct channel between two users, created on demand.
    async fn get_direct_channel(&self, user_a: &str, user_b: &str) -> Result<Channel>;
    async fn get_post(&self, post_id: &str) -> Result<HostPost>;
    /// Every post of the thread containing `post_id`, oldest first, root
    /// included.
    async fn get_post_thread(&self, post_id: &str) -> Result<Vec<HostPost>>;
    /// Channel posts created at or after `since_ms`, oldest first.
    async fn get_posts_since(&self, channel_id: &str, since_ms: i64) -> Result<Vec<HostPost>>;
    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo>;
    /// At most `max_bytes` of the file's content.
    async fn read_file(&self, file_id: &str, max_bytes: u64) -> Result<Vec<u8>>;
    async fn create_post(&self, post: HostPost) -> Result<HostPost>;
    async fn update_post(&self, post: HostPost) -> Result<HostPost>;
    /// Post `post` into the direct channel between `bot_user_id` and
    /// `user_id`.
    async fn dm(&self, bot_user_id: &str, user_id: &str, post: HostPost) -> Result<HostPost>;
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Cluster-wide mutex keyed by `key`.
    async fn lock(&self, key: &str) -> Result<()>;
    async fn unlock(&self, key: &str) -> Result<()>;
    /// Create (or reactivate) the platform user backing a bot and return its
    /// user id.
    async fn ensure_bot_user(&self, username: &str, display_name: &str) -> Result<String>;
    async fn deactivate_bot_user(&self, user_id: &str) -> Result<()>;
}
