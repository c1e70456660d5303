//! Builds the per-request [`RequestContext`].

use crate::bots::Bot;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tm_domain::context::{ChannelSummary, RequestContext, UserSummary};
use tm_domain::host::{Channel, HostClient, User};
use tm_mcp_client::UserClientManager;
use tm_tools::builtin::builtin_tools;
use tm_tools::{ToolStore, TraceSink};

const TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %Z";

/// Format `now` in the IANA zone `timezone`, falling back to UTC for an
/// empty or unknown zone.
pub fn format_time(now: DateTime<Utc>, timezone: &str) -> String {
    match timezone.parse::<Tz>() {
        Ok(tz) => now.with_timezone(&tz).format(TIME_FORMAT).to_string(),
        Err(_) => {
            if !timezone.is_empty() {
                tracing::debug!(%timezone, "unknown timezone, using UTC");
            }
            now.format(TIME_FORMAT).to_string()
        }
    }
}

pub fn user_summary(user: &User) -> UserSummary {
    UserSummary {
        id: user.id.clone(),
        username: user.username.clone(),
        full_name: user.full_name(),
        locale: user.locale.clone(),
        timezone: user.timezone.clone(),
    }
}

pub fn channel_summary(bot: &Bot, channel: &Channel) -> ChannelSummary {
    ChannelSummary {
        id: channel.id.clone(),
        name: channel.name.clone(),
        display_name: channel.display_name.clone(),
        kind: channel.kind,
        team_id: channel.team_id.clone(),
        is_dm_with_bot: bot.is_dm(channel),
    }
}

pub struct ContextBuilder {
    host: Arc<dyn HostClient>,
    mcp: Option<Arc<UserClientManager>>,
    trace: Arc<dyn TraceSink>,
}

impl ContextBuilder {
    pub fn new(
        host: Arc<dyn HostClient>,
        mcp: Option<Arc<UserClientManager>>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self { host, mcp, trace }
    }

    /// Context for `user` talking to `bot` in `channel`.
    ///
    /// With `with_tools`, a bot that offers tools gets the built-in host
    /// tools plus the user's remote tools, but only in a direct channel
    /// with the bot.
    pub async fn build(
        &self,
        bot: &Bot,
        user: &User,
        channel: Option<&Channel>,
        with_tools: bool,
    ) -> RequestContext {
        let mut ctx = RequestContext::new(user_summary(user), bot.summary())
            .with_time(format_time(Utc::now(), &user.timezone));
        if let Some(channel) = channel {
            ctx = ctx.with_channel(channel_summary(bot, channel));
        }

        if with_tools && bot.offers_tools() && ctx.is_dm_with_bot() {
            let store = ToolStore::new().with_trace_sink(self.trace.clone());
            store.add_tools(builtin_tools(self.host.clone()));
            if let Some(mcp) = &self.mcp {
                mcp.register_tools(&store, &user.id).await;
            }
            tracing::debug!(
                request_id = %ctx.request_id,
                tools = store.len(),
                "tools available for request"
            );
            ctx = ctx.with_tools(Arc::new(store));
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::MemoryHost;
    use tm_test_support::ScriptedModel;
    use chrono::TimeZone;
    use tm_domain::config::{AuthConfig, BotConfig, ServiceConfig, ServiceKind};
    use tm_domain::host::ChannelType;
    use tm_tools::LogTraceSink;

    fn bot(disable_tools: bool) -> Bot {
        let mut service = ServiceConfig::new(ServiceKind::Openai);
        service.auth = AuthConfig::with_key("sk");
        let mut cfg = BotConfig::new("matty", "Matty", service);
        cfg.disable_tools = disable_tools;
        Bot::new(cfg, "bot1", Arc::new(ScriptedModel::new()))
    }

    fn channel(kind: ChannelType, name: &str) -> Channel {
        Channel {
            id: "c1".into(),
            team_id: "t1".into(),
            kind,
            name: name.into(),
            display_name: String::new(),
        }
    }

    fn builder() -> ContextBuilder {
        ContextBuilder::new(Arc::new(MemoryHost::new()), None, Arc::new(LogTraceSink))
    }

    fn user() -> User {
        User {
            id: "u1".into(),
            username: "alice".into(),
            timezone: "Europe/Paris".into(),
            ..Default::default()
        }
    }

    #[test]
    fn time_uses_user_zone() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(format_time(now, "Europe/Paris"), "Mon, 01 Jan 2024 13:00:00 CET");
        assert_eq!(format_time(now, ""), "Mon, 01 Jan 2024 12:00:00 UTC");
        assert_eq!(format_time(now, "Mars/Olympus"), "Mon, 01 Jan 2024 12:00:00 UTC");
    }

    #[tokio::test]
    async fn dm_with_tool_bot_gets_builtin_tools() {
        let ctx = builder()
            .build(&bot(false), &user(), Some(&channel(ChannelType::Direct, "bot1__u1")), true)
            .await;
        assert!(ctx.is_dm_with_bot());
        let names: Vec<_> = ctx.tool_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["lookup_user", "read_post"]);
    }

    #[tokio::test]
    async fn no_tools_outside_dm_or_when_disabled() {
        let open = builder()
            .build(&bot(false), &user(), Some(&channel(ChannelType::Open, "general")), true)
            .await;
        assert!(open.tools.is_none());

        let disabled = builder()
            .build(&bot(true), &user(), Some(&channel(ChannelType::Direct, "bot1__u1")), true)
            .await;
        assert!(disabled.tools.is_none());

        let not_requested = builder()
            .build(&bot(false), &user(), Some(&channel(ChannelType::Direct, "bot1__u1")), false)
            .await;
        assert!(not_requested.tools.is_none());
    }

    #[tokio::test]
    async fn summaries_are_filled() {
        let ctx = builder().build(&bot(false), &user(), None, true).await;
        assert_eq!(ctx.user.username, "alice");
        assert_eq!(ctx.bot.user_id, "bot1");
        assert!(ctx.channel.is_none());
        assert!(!ctx.time.is_empty());
    }
}
