//! Chat thread to provider-neutral conversation.
//!
//! Roles come from authorship only: posts by any active bot account are
//! assistant turns, everything else is a user turn. System posts are never
//! produced from thread content.

use crate::bots::Bot;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use tm_domain::capability::ModelCapabilities;
use tm_domain::conversation::{FileAttachment, Post, Role};
use tm_domain::error::Result;
use tm_domain::host::{props, FileInfo, HostClient, HostPost, MessageAttachment};
use tm_domain::tool::ToolUse;

const ATTACHED_FILES_HEADING: &str = "Attached File Contents:";

/// Per-bot knobs for file handling.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub max_file_size: u64,
    pub vision: bool,
    pub capabilities: ModelCapabilities,
}

impl ConversionOptions {
    pub fn for_bot(bot: &Bot) -> Self {
        Self {
            max_file_size: bot.config().max_file_size,
            vision: bot.config().enable_vision,
            capabilities: bot.model().capabilities().clone(),
        }
    }

    fn accepts_image(&self, mime_type: &str) -> bool {
        self.vision && self.capabilities.accepts_image(mime_type)
    }
}

/// System turn made of the rendered template text followed by the bot's
/// custom instructions. `None` when both are blank.
pub fn system_post(template_system: &str, custom_instructions: &str) -> Option<Post> {
    let parts: Vec<&str> = [template_system.trim(), custom_instructions.trim()]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(Post::system(parts.join("\n\n")))
    }
}

/// Visible message followed by the flattened text of any structured
/// attachments.
pub fn message_text(post: &HostPost) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !post.message.is_empty() {
        parts.push(post.message.clone());
    }
    for attachment in &post.attachments {
        parts.extend(attachment_lines(attachment));
    }
    parts.join("\n")
}

fn attachment_lines(a: &MessageAttachment) -> Vec<String> {
    let mut lines = Vec::new();
    for text in [&a.pretext, &a.title, &a.text] {
        if !text.is_empty() {
            lines.push(text.clone());
        }
    }
    for field in &a.fields {
        lines.push(format!("{}: {}", field.title, field.value));
    }
    if !a.footer.is_empty() {
        lines.push(a.footer.clone());
    }
    lines
}

fn prop_json<T: DeserializeOwned>(post: &HostPost, key: &str) -> Option<T> {
    let value = post.prop(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(post_id = %post.id, prop = key, error = %e, "ignoring malformed post property");
            None
        }
    }
}

/// Tool records awaiting approval on a bot post.
pub fn pending_tool_calls(post: &HostPost) -> Vec<ToolUse> {
    prop_json(post, props::PENDING_TOOL_CALLS).unwrap_or_default()
}

/// Approval rounds already resolved on a bot post.
pub fn resolved_tool_calls(post: &HostPost) -> Vec<Vec<ToolUse>> {
    prop_json(post, props::RESOLVED_TOOL_CALLS).unwrap_or_default()
}

/// The assistant call turn and the user result turn of one resolved round.
pub fn tool_round(text: impl Into<String>, records: Vec<ToolUse>) -> [Post; 2] {
    [Post::tool_calls(text, records.clone()), Post::tool_results(records)]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConversationBuilder<'a> {
    host: &'a dyn HostClient,
    bot_user_ids: &'a HashSet<String>,
    opts: ConversionOptions,
}

impl<'a> ConversationBuilder<'a> {
    pub fn new(host: &'a dyn HostClient, bot_user_ids: &'a HashSet<String>, opts: ConversionOptions) -> Self {
        Self {
            host,
            bot_user_ids,
            opts,
        }
    }

    pub fn role_of(&self, post: &HostPost) -> Role {
        if self.bot_user_ids.contains(&post.user_id) {
            Role::Assistant
        } else {
            Role::User
        }
    }

    /// Convert a whole thread, oldest first.
    pub async fn thread_to_posts(&self, thread: &[HostPost]) -> Result<Vec<Post>> {
        let mut out = Vec::with_capacity(thread.len());
        for post in thread {
            out.extend(self.convert(post).await?);
        }
        Ok(out)
    }

    /// Convert one host post. A bot post that went through tool approval
    /// expands to its call/result rounds followed by its text.
    pub async fn convert(&self, post: &HostPost) -> Result<Vec<Post>> {
        let role = self.role_of(post);
        let (message, files) = self.body(post).await?;

        let mut out = Vec::new();
        if role == Role::Assistant {
            for round in resolved_tool_calls(post) {
                out.extend(tool_round("", round));
            }
            let pending = pending_tool_calls(post);
            let mut turn = Post::assistant(message).with_files(files);
            turn.tool_uses = pending;
            if !turn.is_empty() {
                out.push(turn);
            }
        } else {
            let turn = Post::user(message).with_files(files);
            if !turn.is_empty() {
                out.push(turn);
            }
        }
        Ok(out)
    }

    /// Message text with inlined text files, plus image attachments.
    async fn body(&self, post: &HostPost) -> Result<(String, Vec<FileAttachment>)> {
        let mut message = message_text(post);
        let mut sections = Vec::new();
        let mut images = Vec::new();

        for file_id in &post.file_ids {
            let info = match self.host.get_file_info(file_id).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(post_id = %post.id, file_id = %file_id, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            if info.extracted_content.is_some() || info.mime_type.starts_with("text/") {
                match self.file_text(&info).await {
                    Ok(body) => sections.push(format!("File Name: {}\nContent: {}", info.name, body)),
                    Err(e) => {
                        tracing::warn!(file_id = %file_id, error = %e, "failed to read text file")
                    }
                }
            }
            if self.opts.accepts_image(&info.mime_type) {
                match self.image(&info).await {
                    Ok(Some(image)) => images.push(image),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(file_id = %file_id, error = %e, "failed to read image"),
                }
            }
        }

        if !sections.is_empty() {
            if !message.is_empty() {
                message.push_str("\n\n");
            }
            message.push_str(ATTACHED_FILES_HEADING);
            message.push('\n');
            message.push_str(&sections.join("\n\n"));
        }
        Ok((message, images))
    }

    async fn file_text(&self, info: &FileInfo) -> Result<String> {
        let max = self.opts.max_file_size;
        let (mut body, truncated) = match &info.extracted_content {
            Some(text) => truncate_bytes(text, max as usize),
            None => {
                let bytes = self.host.read_file(&info.id, max.saturating_add(1)).await?;
                let truncated = bytes.len() as u64 > max;
                let end = bytes.len().min(max as usize);
                (String::from_utf8_lossy(&bytes[..end]).into_owned(), truncated)
            }
        };
        if truncated {
            body.push_str(&format!(
                "\n\n(File truncated: only the first {max} bytes are included.)"
            ));
        }
        Ok(body)
    }

    async fn image(&self, info: &FileInfo) -> Result<Option<FileAttachment>> {
        if info.size > self.opts.max_file_size {
            tracing::info!(file_id = %info.id, size = info.size, "image exceeds size limit, not attached");
            return Ok(None);
        }
        let data = self.host.read_file(&info.id, self.opts.max_file_size).await?;
        Ok(Some(FileAttachment {
            name: info.name.clone(),
            mime_type: info.mime_type.clone(),
            size: data.len() as u64,
            data: data.into(),
        }))
    }
}

/// First `max` bytes of `text`, cut back to a char boundary.
fn truncate_bytes(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_owned(), false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_owned(), true)
}
