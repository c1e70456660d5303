//! Entry points the host platform calls.
//!
//! Every operation that produces a bot answer ends the same way: a target
//! post owned by the bot, a stream registered for it, and a writer task
//! filling it. The returned [`StreamJob`] lets callers wait for that task.

use crate::bots::{check_usage, Bot, BotManager};
use crate::context::{format_time, ContextBuilder};
use crate::conversation::{pending_tool_calls, resolved_tool_calls};
use crate::filters::skip_reason;
use crate::meetings::MeetingsService;
use crate::notices::{self, Notice};
use crate::orchestrator::Orchestrator;
use crate::streams::StreamHandle;
use crate::writer::{StreamWriter, WriteOutcome};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tm_domain::context::RequestContext;
use tm_domain::error::{Error, Result};
use tm_domain::host::{props, HostClient, HostPost, User};
use tm_domain::stream::TextStream;
use tm_domain::tool::ToolUse;
use tm_prompts::names;
use tm_tools::builtin::format_thread;
use tokio::task::JoinHandle;

/// The canned thread analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    SummarizeThread,
    ActionItems,
    OpenQuestions,
}

impl AnalysisKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisKind::SummarizeThread => "summarize_thread",
            AnalysisKind::ActionItems => "action_items",
            AnalysisKind::OpenQuestions => "open_questions",
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            AnalysisKind::SummarizeThread => names::SUMMARIZE_THREAD,
            AnalysisKind::ActionItems => names::FIND_ACTION_ITEMS,
            AnalysisKind::OpenQuestions => names::FIND_OPEN_QUESTIONS,
        }
    }
}

impl FromStr for AnalysisKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "summarize_thread" => Ok(AnalysisKind::SummarizeThread),
            "action_items" => Ok(AnalysisKind::ActionItems),
            "open_questions" => Ok(AnalysisKind::OpenQuestions),
            other => Err(Error::Other(format!("unknown analysis kind: {other}"))),
        }
    }
}

/// A writer task filling one post.
pub struct StreamJob {
    pub post_id: String,
    handle: JoinHandle<WriteOutcome>,
}

impl StreamJob {
    pub async fn wait(self) -> Result<WriteOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Other(format!("stream writer task failed: {e}")))
    }
}

pub struct Conversations {
    host: Arc<dyn HostClient>,
    bots: Arc<BotManager>,
    orchestrator: Arc<Orchestrator>,
    contexts: ContextBuilder,
    writer: Arc<StreamWriter>,
    meetings: OnceLock<Arc<dyn MeetingsService>>,
}

impl Conversations {
    pub fn new(
        host: Arc<dyn HostClient>,
        bots: Arc<BotManager>,
        orchestrator: Arc<Orchestrator>,
        contexts: ContextBuilder,
        writer: Arc<StreamWriter>,
    ) -> Self {
        Self {
            host,
            bots,
            orchestrator,
            contexts,
            writer,
            meetings: OnceLock::new(),
        }
    }

    /// Install the meetings capability. Only the first call has an effect.
    pub fn set_meetings_service(&self, service: Arc<dyn MeetingsService>) -> bool {
        self.meetings.set(service).is_ok()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Incoming posts
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// React to a new user post. Returns `None` when the post does not
    /// address a bot or the user may not use it here.
    pub async fn handle_post(&self, post: &HostPost) -> Result<Option<StreamJob>> {
        if let Some(reason) = skip_reason(post, &self.bots.bot_user_ids()) {
            tracing::debug!(post_id = %post.id, reason = reason.as_str(), "ignoring post");
            return Ok(None);
        }

        let channel = self.host.get_channel(&post.channel_id).await?;
        let dm_bot = self.bots.get_bot_for_dm_channel(&channel);
        let is_dm = dm_bot.is_some();
        let Some(bot) = dm_bot.or_else(|| self.bots.get_bot_mentioned(&post.message)) else {
            return Ok(None);
        };

        let user = self.host.get_user(&post.user_id).await?;
        if let Err(e) = check_usage(&bot, &user, &channel) {
            tracing::info!(bot = %bot.name(), post_id = %post.id, error = %e, "usage denied");
            let notice = HostPost {
                channel_id: post.channel_id.clone(),
                root_id: post.thread_root().to_owned(),
                user_id: bot.user_id().to_owned(),
                message: notices::text(Notice::PermissionDenied, &user.locale).to_owned(),
                ..Default::default()
            };
            self.host.create_post(notice).await?;
            return Ok(None);
        }

        let ctx = self.contexts.build(&bot, &user, Some(&channel), true).await;
        tracing::info!(
            request_id = %ctx.request_id,
            bot = %bot.name(),
            post_id = %post.id,
            dm = is_dm,
            "answering post"
        );

        let mut reply = HostPost {
            channel_id: post.channel_id.clone(),
            // Channel mentions are answered in a thread; DMs keep the user's
            // threading.
            root_id: if is_dm {
                post.root_id.clone()
            } else {
                post.thread_root().to_owned()
            },
            user_id: bot.user_id().to_owned(),
            ..Default::default()
        };
        reply.set_prop(props::REQUESTER, user.id.clone());
        reply.set_prop(props::RESPONDING_TO, post.id.clone());
        let reply = self.host.create_post(reply).await?;

        let handle = self.writer.contexts().register(&reply.id);
        let stream = self
            .orchestrator
            .conversation_completion(&bot, &ctx, post, handle.token.clone())
            .await;
        Ok(Some(self.spawn_writer(reply, or_error(stream), handle, &user)))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Requester actions on a bot post
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Resubmit the pending tool calls of `post_id` with the ids the
    /// requester accepted. Everything else is rejected.
    pub async fn handle_tool_call(&self, user_id: &str, post_id: &str, accepted: &[String]) -> Result<StreamJob> {
        let post = self.host.get_post(post_id).await?;
        ensure_requester(&post, user_id)?;
        let bot = self.bot_for_post(&post)?;
        let user = self.host.get_user(user_id).await?;
        let channel = self.host.get_channel(&post.channel_id).await?;
        let ctx = self.contexts.build(&bot, &user, Some(&channel), true).await;

        let (mut post, pending) = self.claim_pending_tool_calls(post_id, user_id).await?;
        tracing::info!(
            request_id = %ctx.request_id,
            post_id = %post_id,
            pending = pending.len(),
            accepted = accepted.len(),
            "resubmitting tool calls"
        );

        let handle = self.writer.contexts().register(&post.id);
        let resubmission = self
            .orchestrator
            .resubmit(&bot, &ctx, &post, pending, accepted, handle.token.clone())
            .await;

        let mut rounds = resolved_tool_calls(&post);
        rounds.push(resubmission.round);
        post.set_prop(props::RESOLVED_TOOL_CALLS, serde_json::to_value(&rounds)?);
        let post = self.host.update_post(post).await?;
        Ok(self.spawn_writer(post, resubmission.stream, handle, &user))
    }

    /// Take the pending tool calls off `post_id` under the post's lock. The
    /// cleared post is saved before any tool runs, so a concurrent approval
    /// of the same post finds nothing to resolve.
    async fn claim_pending_tool_calls(&self, post_id: &str, user_id: &str) -> Result<(HostPost, Vec<ToolUse>)> {
        let key = format!("tool_calls/{post_id}");
        self.host.lock(&key).await?;
        let claimed: Result<(HostPost, Vec<ToolUse>)> = async {
            let mut post = self.host.get_post(post_id).await?;
            ensure_requester(&post, user_id)?;
            let pending = pending_tool_calls(&post);
            if pending.is_empty() {
                return Err(Error::Other(format!("post {post_id} has no pending tool calls")));
            }
            post.remove_prop(props::PENDING_TOOL_CALLS);
            let post = self.host.update_post(post).await?;
            Ok((post, pending))
        }
        .await;
        if let Err(e) = self.host.unlock(&key).await {
            tracing::warn!(post_id = %post_id, error = %e, "failed to release tool call lock");
        }
        claimed
    }

    /// Cancel the live stream of `post_id`. Only its requester may.
    pub async fn stop(&self, post_id: &str, requester: &str) -> Result<bool> {
        let post = self.host.get_post(post_id).await?;
        ensure_requester(&post, requester)?;
        let stopped = self.writer.contexts().cancel(post_id);
        tracing::info!(post_id = %post_id, stopped, "stop requested");
        Ok(stopped)
    }

    /// Produce the answer in `post_id` again from scratch.
    pub async fn regenerate(&self, post_id: &str, requester: &str) -> Result<StreamJob> {
        let mut post = self.host.get_post(post_id).await?;
        if post.has_prop(props::NO_REGEN) {
            return Err(Error::Permission(format!("post {post_id} cannot be regenerated")));
        }
        ensure_requester(&post, requester)?;
        let bot = self.bot_for_post(&post)?;
        let user = self.host.get_user(requester).await?;

        let plan = if let Some(recording) = post.prop_str(props::REFERENCED_TRANSCRIPT) {
            let meetings = self
                .meetings
                .get()
                .cloned()
                .ok_or_else(|| Error::Config("meeting transcripts are not available".into()))?;
            Regeneration::Transcript(meetings, recording.to_owned())
        } else if let (Some(root), Some(kind)) = (
            post.prop_str(props::REFERENCED_THREAD),
            post.prop_str(props::PROMPT_TYPE),
        ) {
            Regeneration::Analysis(root.to_owned(), kind.parse()?)
        } else if let Some(anchor) = post.prop_str(props::RESPONDING_TO) {
            Regeneration::Conversation(anchor.to_owned())
        } else {
            return Err(Error::Other(format!("post {post_id} has nothing to regenerate")));
        };

        post.message.clear();
        post.remove_prop(props::PENDING_TOOL_CALLS);
        post.remove_prop(props::RESOLVED_TOOL_CALLS);
        let post = self.host.update_post(post).await?;

        let handle = self.writer.contexts().register(&post.id);
        let token = handle.token.clone();
        tracing::info!(post_id = %post_id, bot = %bot.name(), "regenerating");
        let stream = match plan {
            Regeneration::Transcript(meetings, recording_id) => {
                self.transcript_stream(&bot, &user, meetings.as_ref(), &recording_id, token)
                    .await
            }
            Regeneration::Analysis(root, kind) => self.analysis_stream(&bot, &user, &root, kind, token).await,
            Regeneration::Conversation(anchor_id) => {
                self.conversation_stream(&bot, &user, &anchor_id, token).await
            }
        };
        Ok(self.spawn_writer(post, or_error(stream), handle, &user))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Analyses delivered by DM
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run analysis `kind` over the thread rooted at `root_id` and DM the
    /// result to the user.
    pub async fn analyze_thread(
        &self,
        bot: &Arc<Bot>,
        user_id: &str,
        root_id: &str,
        kind: AnalysisKind,
    ) -> Result<StreamJob> {
        let user = self.host.get_user(user_id).await?;
        let root = self.host.get_post(root_id).await?;
        let channel = self.host.get_channel(&root.channel_id).await?;
        check_usage(bot, &user, &channel)?;

        let mut post = HostPost::default();
        post.set_prop(props::REFERENCED_THREAD, root_id);
        post.set_prop(props::PROMPT_TYPE, kind.as_str());
        post.set_prop(props::REQUESTER, user.id.clone());
        let post = self.host.dm(bot.user_id(), &user.id, post).await?;

        let handle = self.writer.contexts().register(&post.id);
        let stream = self
            .analysis_stream(bot, &user, root_id, kind, handle.token.clone())
            .await;
        Ok(self.spawn_writer(post, or_error(stream), handle, &user))
    }

    /// Summarize what happened in `channel_id` since `since_ms` and DM the
    /// result to the user.
    pub async fn summarize_channel_since(
        &self,
        bot: &Arc<Bot>,
        user_id: &str,
        channel_id: &str,
        since_ms: i64,
    ) -> Result<StreamJob> {
        let user = self.host.get_user(user_id).await?;
        let channel = self.host.get_channel(channel_id).await?;
        check_usage(bot, &user, &channel)?;

        let posts = self.host.get_posts_since(channel_id, since_ms).await?;
        let since = Utc
            .timestamp_millis_opt(since_ms)
            .single()
            .ok_or_else(|| Error::Other(format!("invalid timestamp: {since_ms}")))?;
        let ctx = self
            .contexts
            .build(bot, &user, Some(&channel), false)
            .await
            .with_parameter("since", format_time(since, &user.timezone))
            .with_parameter("posts", self.format_posts(&posts).await);

        let mut post = HostPost::default();
        post.set_prop(props::REQUESTER, user.id.clone());
        post.set_prop(props::NO_REGEN, true);
        let post = self.host.dm(bot.user_id(), &user.id, post).await?;

        let handle = self.writer.contexts().register(&post.id);
        let stream = self
            .orchestrator
            .template_completion(bot, &ctx, names::CHANNEL_INTERVAL_SINCE, handle.token.clone())
            .await;
        Ok(self.spawn_writer(post, or_error(stream), handle, &user))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn conversation_stream(
        &self,
        bot: &Arc<Bot>,
        user: &User,
        anchor_id: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<TextStream> {
        let anchor = self.host.get_post(anchor_id).await?;
        let channel = self.host.get_channel(&anchor.channel_id).await?;
        let ctx = self.contexts.build(bot, user, Some(&channel), true).await;
        self.orchestrator
            .conversation_completion(bot, &ctx, &anchor, cancel)
            .await
    }

    async fn analysis_stream(
        &self,
        bot: &Arc<Bot>,
        user: &User,
        root_id: &str,
        kind: AnalysisKind,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<TextStream> {
        let thread = self.host.get_post_thread(root_id).await?;
        let dm = self.host.get_direct_channel(bot.user_id(), &user.id).await?;
        let ctx = self
            .contexts
            .build(bot, user, Some(&dm), false)
            .await
            .with_parameter("thread", self.format_posts(&thread).await);
        self.orchestrator
            .template_completion(bot, &ctx, kind.template(), cancel)
            .await
    }

    async fn transcript_stream(
        &self,
        bot: &Arc<Bot>,
        user: &User,
        meetings: &dyn MeetingsService,
        recording_id: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<TextStream> {
        let recording = self.host.get_post(recording_id).await?;
        let file_id = meetings
            .captions_file_id(&recording)
            .await?
            .ok_or_else(|| Error::Other(format!("recording {recording_id} has no captions")))?;
        let dm = self.host.get_direct_channel(bot.user_id(), &user.id).await?;
        let ctx: RequestContext = self.contexts.build(bot, user, Some(&dm), false).await;
        meetings
            .summarize_transcription(bot.model().as_ref(), ctx, &file_id, cancel)
            .await
    }

    /// `author: message` lines, with authors resolved to usernames.
    async fn format_posts(&self, posts: &[HostPost]) -> String {
        let mut names: HashMap<String, String> = HashMap::new();
        for post in posts {
            if names.contains_key(&post.user_id) {
                continue;
            }
            match self.host.get_user(&post.user_id).await {
                Ok(user) => {
                    names.insert(post.user_id.clone(), user.username);
                }
                Err(e) => tracing::debug!(user_id = %post.user_id, error = %e, "unknown post author"),
            }
        }
        format_thread(posts, &names)
    }

    fn bot_for_post(&self, post: &HostPost) -> Result<Arc<Bot>> {
        self.bots
            .get_bot_by_user_id(&post.user_id)
            .ok_or_else(|| Error::Config(format!("post {} is not owned by an active bot", post.id)))
    }

    fn spawn_writer(&self, post: HostPost, stream: TextStream, handle: StreamHandle, user: &User) -> StreamJob {
        let writer = self.writer.clone();
        let locale = user.locale.clone();
        let post_id = post.id.clone();
        let handle = tokio::spawn(async move { writer.write(post, stream, handle, &locale).await });
        StreamJob { post_id, handle }
    }
}

enum Regeneration {
    Transcript(Arc<dyn MeetingsService>, String),
    Analysis(String, AnalysisKind),
    Conversation(String),
}

fn ensure_requester(post: &HostPost, user_id: &str) -> Result<()> {
    match post.prop_str(props::REQUESTER) {
        Some(requester) if requester == user_id => Ok(()),
        _ => Err(Error::Permission(format!(
            "user {user_id} did not request post {}",
            post.id
        ))),
    }
}

/// A failed start still goes through the writer so the post gets a notice
/// and the stream handle is released.
fn or_error(stream: Result<TextStream>) -> TextStream {
    stream.unwrap_or_else(TextStream::from_error)
}
