use crate::tool::ToolUse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A file attached to a post and forwarded to the model as an image block.
///
/// Text files never reach this type: their content is inlined into the
/// message body by the conversation builder.
#[derive(Clone, PartialEq)]
pub struct FileAttachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Arc<[u8]>,
}

impl std::fmt::Debug for FileAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAttachment")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A role-tagged item of a provider-neutral conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub role: Role,
    pub message: String,
    pub files: Vec<FileAttachment>,
    /// On assistant posts: the calls the model made. On user posts: the
    /// same calls carrying their results.
    pub tool_uses: Vec<ToolUse>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Post {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
            files: Vec::new(),
            tool_uses: Vec::new(),
        }
    }
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn carrying the model's tool calls.
    pub fn tool_calls(text: impl Into<String>, calls: Vec<ToolUse>) -> Self {
        Self {
            tool_uses: calls,
            ..Self::assistant(text)
        }
    }

    /// User turn answering a previous tool-call turn.
    pub fn tool_results(results: Vec<ToolUse>) -> Self {
        Self {
            tool_uses: results,
            ..Self::user("")
        }
    }

    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = files;
        self
    }

    /// Tool records that may be shown to a model. Pending and accepted
    /// records have no outcome yet and are never replayed.
    pub fn replayable_tool_uses(&self) -> impl Iterator<Item = &ToolUse> {
        self.tool_uses.iter().filter(|t| t.is_terminal())
    }

    /// A user turn answering an earlier tool-call turn.
    pub fn is_tool_results(&self) -> bool {
        self.role == Role::User && !self.tool_uses.is_empty()
    }

    /// True when the post carries nothing a provider could send.
    pub fn is_empty(&self) -> bool {
        self.message.trim().is_empty() && self.files.is_empty() && self.tool_uses.is_empty()
    }
}
