//! Tools backed by the chat host.
//!
//! Offered only when the bot has tools enabled and the request comes from a
//! direct message with the bot; the runtime enforces that before adding
//! them to a request's store.

use crate::args::ToolArgs;
use crate::store::{Tool, ToolResolver};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tm_domain::context::RequestContext;
use tm_domain::error::{Error, Result};
use tm_domain::host::{ChannelType, HostClient, HostPost, User};

/// The built-in tool set for one host.
pub fn builtin_tools(host: Arc<dyn HostClient>) -> Vec<Tool> {
    vec![
        Tool::new(
            "lookup_user",
            "Look up a user by username. Returns their name, position, locale and timezone.",
            json!({
                "type": "object",
                "properties": {
                    "username": {"type": "string", "description": "Username, with or without a leading @"}
                },
                "required": ["username"],
            }),
            LookupUser { host: host.clone() },
        ),
        Tool::new(
            "read_post",
            "Read a post and the rest of its thread by post id.",
            json!({
                "type": "object",
                "properties": {
                    "post_id": {"type": "string", "description": "Id of any post in the thread"}
                },
                "required": ["post_id"],
            }),
            ReadPost { host },
        ),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// lookup_user
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LookupUser {
    host: Arc<dyn HostClient>,
}

#[derive(Deserialize)]
struct LookupUserArgs {
    username: String,
}

#[async_trait::async_trait]
impl ToolResolver for LookupUser {
    async fn call(&self, _ctx: &RequestContext, args: ToolArgs) -> Result<String> {
        let a: LookupUserArgs = args.decode()?;
        let username = a.username.trim().trim_start_matches('@');
        let user = self
            .host
            .get_user_by_username(username)
            .await
            .map_err(|e| Error::Tool {
                name: "lookup_user".into(),
                message: format!("user {username} not found: {e}"),
            })?;
        Ok(describe_user(&user))
    }
}

fn describe_user(user: &User) -> String {
    let mut lines = vec![format!("Username: {}", user.username)];
    let full_name = user.full_name();
    if !full_name.is_empty() {
        lines.push(format!("Full name: {full_name}"));
    }
    for (label, value) in [
        ("Nickname", &user.nickname),
        ("Position", &user.position),
        ("Locale", &user.locale),
        ("Timezone", &user.timezone),
    ] {
        if !value.is_empty() {
            lines.push(format!("{label}: {value}"));
        }
    }
    if user.is_bot {
        lines.push("This account is a bot.".into());
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_post
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ReadPost {
    host: Arc<dyn HostClient>,
}

#[derive(Deserialize)]
struct ReadPostArgs {
    post_id: String,
}

#[async_trait::async_trait]
impl ToolResolver for ReadPost {
    async fn call(&self, ctx: &RequestContext, args: ToolArgs) -> Result<String> {
        let a: ReadPostArgs = args.decode()?;
        let denied = || Error::Tool {
            name: "read_post".into(),
            message: format!("post {} not found or not accessible", a.post_id),
        };

        let post = self.host.get_post(&a.post_id).await.map_err(|_| denied())?;
        let channel = self
            .host
            .get_channel(&post.channel_id)
            .await
            .map_err(|_| denied())?;
        let requester = self.host.get_user(&ctx.user.id).await.map_err(|_| denied())?;

        let visible = match channel.kind {
            ChannelType::Direct | ChannelType::Group => channel.name.contains(&requester.id),
            ChannelType::Open | ChannelType::Private => {
                requester.team_ids.iter().any(|t| t == &channel.team_id)
            }
        };
        if !visible {
            tracing::debug!(post_id = %a.post_id, user = %ctx.user.id, "read_post denied");
            return Err(denied());
        }

        let thread = self.host.get_post_thread(post.thread_root()).await?;
        let mut names: HashMap<String, String> = HashMap::new();
        for p in &thread {
            if !names.contains_key(&p.user_id) {
                let name = match self.host.get_user(&p.user_id).await {
                    Ok(u) => u.username,
                    Err(_) => "unknown".to_string(),
                };
                names.insert(p.user_id.clone(), name);
            }
        }
        Ok(format_thread(&thread, &names))
    }
}

/// `author: message` per post, in thread order.
pub fn format_thread(posts: &[HostPost], usernames: &HashMap<String, String>) -> String {
    posts
        .iter()
        .filter(|p| !p.message.trim().is_empty())
        .map(|p| {
            let author = usernames.get(&p.user_id).map_or("unknown", String::as_str);
            format!("{author}: {}", p.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
