//! Completion orchestration.
//!
//! Assembles prompt, thread history and the user's turn, starts the bot's
//! model and forwards its canonical events. A tool-calls event ends the
//! stream: the writer parks the calls on the post and nothing runs until
//! the requester resubmits with the ids they accept. Each resubmission is
//! one round; the number of rounds per post is capped.

use crate::bots::{Bot, BotManager};
use crate::conversation::{
    resolved_tool_calls, system_post, tool_round, ConversationBuilder, ConversionOptions,
};
use crate::meta::PostMetaStore;
use std::sync::Arc;
use tm_domain::context::RequestContext;
use tm_domain::conversation::Post;
use tm_domain::error::{Error, Result};
use tm_domain::host::{props, HostClient, HostPost};
use tm_domain::stream::{StreamEvent, TextStream};
use tm_domain::tool::ToolUse;
use tm_domain::trace::TraceEvent;
use tm_prompts::{names, Prompts};
use tm_providers::{CompletionRequest, LanguageModel};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Most approval rounds one bot post may go through.
pub const MAX_TOOL_DEPTH: usize = 10;

/// Output cap for generated conversation titles.
pub const TITLE_MAX_TOKENS: u32 = 25;

/// Outcome of resubmitting a post's pending tool calls.
pub struct Resubmission {
    /// The round with every record in a terminal state.
    pub round: Vec<ToolUse>,
    pub stream: TextStream,
}

/// Title to generate once a new conversation finishes its first answer.
struct TitleJob {
    root_post_id: String,
    user_message: String,
}

pub struct Orchestrator {
    host: Arc<dyn HostClient>,
    bots: Arc<BotManager>,
    prompts: Arc<Prompts>,
    meta: Arc<dyn PostMetaStore>,
}

impl Orchestrator {
    pub fn new(
        host: Arc<dyn HostClient>,
        bots: Arc<BotManager>,
        prompts: Arc<Prompts>,
        meta: Arc<dyn PostMetaStore>,
    ) -> Self {
        Self {
            host,
            bots,
            prompts,
            meta,
        }
    }

    pub fn prompts(&self) -> &Prompts {
        &self.prompts
    }

    // ── Conversation turns ──────────────────────────────────────────

    /// Answer `anchor`, a user post addressed to `bot`.
    pub async fn conversation_completion(
        self: &Arc<Self>,
        bot: &Arc<Bot>,
        ctx: &RequestContext,
        anchor: &HostPost,
        cancel: CancellationToken,
    ) -> Result<TextStream> {
        let posts = self.conversation(bot, ctx, anchor).await?;

        let title = if ctx.is_dm_with_bot() && !anchor.is_reply() {
            match self.meta.get(anchor.thread_root()).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(TitleJob {
                    root_post_id: anchor.thread_root().to_owned(),
                    user_message: anchor.message.clone(),
                }),
                Err(e) => {
                    tracing::warn!(request_id = %ctx.request_id, error = %e, "post meta lookup failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(self.start(bot, ctx, posts, true, cancel, title))
    }

    /// Resolve one approval round for `bot_post` and continue the answer.
    ///
    /// Every record in `pending` ends terminal: accepted ids run, the rest
    /// are rejected. Past the depth cap nothing runs and each record is
    /// failed instead. The caller must already have taken `pending` off the
    /// post so a second approval cannot run the same calls.
    pub async fn resubmit(
        self: &Arc<Self>,
        bot: &Arc<Bot>,
        ctx: &RequestContext,
        bot_post: &HostPost,
        pending: Vec<ToolUse>,
        accepted: &[String],
        cancel: CancellationToken,
    ) -> Resubmission {
        let previous = resolved_tool_calls(bot_post);
        if previous.len() + 1 > MAX_TOOL_DEPTH {
            tracing::warn!(
                request_id = %ctx.request_id,
                post_id = %bot_post.id,
                rounds = previous.len(),
                "tool resolution depth exceeded"
            );
            let message = Error::DepthExceeded.to_string();
            let round = pending
                .into_iter()
                .map(|mut record| {
                    record.complete(Err(message.clone()));
                    record
                })
                .collect();
            return Resubmission {
                round,
                stream: TextStream::from_error(Error::DepthExceeded),
            };
        }

        let round = resolve_round(ctx, pending, accepted).await;
        let stream = match self.continuation(bot, ctx, bot_post, previous, &round).await {
            Ok(posts) => self.start(bot, ctx, posts, true, cancel, None),
            Err(e) => TextStream::from_error(e),
        };
        Resubmission { round, stream }
    }

    /// The conversation up to the anchor, every earlier round, then `round`
    /// attached to the bot's text so far.
    async fn continuation(
        &self,
        bot: &Bot,
        ctx: &RequestContext,
        bot_post: &HostPost,
        previous: Vec<Vec<ToolUse>>,
        round: &[ToolUse],
    ) -> Result<Vec<Post>> {
        let anchor_id = bot_post
            .prop_str(props::RESPONDING_TO)
            .ok_or_else(|| Error::Other(format!("post {} is not a reply to a user post", bot_post.id)))?;
        let anchor = self.host.get_post(anchor_id).await?;

        let mut posts = self.conversation(bot, ctx, &anchor).await?;
        for earlier in previous {
            posts.extend(tool_round("", earlier));
        }
        posts.extend(tool_round(bot_post.message.clone(), round.to_vec()));
        Ok(posts)
    }

    /// System prompt, history before `anchor`, then `anchor` itself.
    async fn conversation(&self, bot: &Bot, ctx: &RequestContext, anchor: &HostPost) -> Result<Vec<Post>> {
        let prompt = self.prompts.format(names::DIRECT_MESSAGE_QUESTION, ctx)?;

        let bot_ids = self.bots.bot_user_ids();
        let builder = ConversationBuilder::new(self.host.as_ref(), &bot_ids, ConversionOptions::for_bot(bot));

        let mut posts = Vec::new();
        if let Some(system) = system_post(&prompt.system, &ctx.bot.custom_instructions) {
            posts.push(system);
        }
        if anchor.is_reply() {
            let thread = self.host.get_post_thread(&anchor.id).await?;
            let before: Vec<HostPost> = thread
                .into_iter()
                .take_while(|p| p.id != anchor.id)
                .collect();
            posts.extend(builder.thread_to_posts(&before).await?);
        }
        posts.extend(builder.convert(anchor).await?);
        Ok(posts)
    }

    // ── Template-driven requests ───────────────────────────────────

    /// One-shot completion from template `template` rendered against
    /// `ctx`. Tools are never offered.
    pub async fn template_completion(
        self: &Arc<Self>,
        bot: &Arc<Bot>,
        ctx: &RequestContext,
        template: &str,
        cancel: CancellationToken,
    ) -> Result<TextStream> {
        let prompt = self.prompts.format(template, ctx)?;
        let mut posts = Vec::new();
        if let Some(system) = system_post(&prompt.system, &ctx.bot.custom_instructions) {
            posts.push(system);
        }
        if !prompt.user.trim().is_empty() {
            posts.push(Post::user(prompt.user));
        }
        Ok(self.start(bot, ctx, posts, false, cancel, None))
    }

    // ── Streaming ──────────────────────────────────────────────────

    fn start(
        self: &Arc<Self>,
        bot: &Arc<Bot>,
        ctx: &RequestContext,
        posts: Vec<Post>,
        tools: bool,
        cancel: CancellationToken,
        title: Option<TitleJob>,
    ) -> TextStream {
        let mut req = CompletionRequest::new(posts, ctx.clone()).with_cancel(cancel);
        if !tools || !bot.offers_tools() {
            req = req.without_tools();
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            bot = %bot.name(),
            posts = req.posts.len(),
            tools = req.tools.len(),
            "starting completion"
        );
        let upstream = bot.model().chat_completion(req);

        let (mut tx, rx) = TextStream::channel();
        let this = self.clone();
        let model = bot.model().clone();
        let ctx = ctx.clone();
        let span = tracing::info_span!("completion", request_id = %ctx.request_id, bot = %bot.name());
        tokio::spawn(
            async move {
                let mut upstream = upstream;
                let mut answer = String::new();
                while let Some(event) = upstream.recv().await {
                    let end = matches!(event, StreamEvent::End);
                    if let StreamEvent::Text(chunk) = &event {
                        answer.push_str(chunk);
                    }
                    let terminal = event.is_terminal() || matches!(event, StreamEvent::ToolCalls(_));
                    if !tx.send(event).await && tx.is_closed() {
                        tracing::debug!("completion reader went away");
                        return;
                    }
                    if terminal {
                        if end {
                            if let Some(job) = title {
                                this.spawn_title(model, ctx, job, answer);
                            }
                        } else {
                            // Tool calls end this leg; the writer stops reading.
                            tx.end().await;
                        }
                        return;
                    }
                }
                tx.error(Error::Other("completion stream closed without end".into()))
                    .await;
            }
            .instrument(span),
        );
        rx
    }

    // ── Titles ─────────────────────────────────────────────────────

    fn spawn_title(self: Arc<Self>, model: Arc<dyn LanguageModel>, ctx: RequestContext, job: TitleJob, answer: String) {
        tokio::spawn(async move {
            if let Err(e) = self.generate_title(model.as_ref(), ctx.clone(), &job, &answer).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    root_post_id = %job.root_post_id,
                    error = %e,
                    "title generation failed"
                );
            }
        });
    }

    async fn generate_title(
        &self,
        model: &dyn LanguageModel,
        ctx: RequestContext,
        job: &TitleJob,
        answer: &str,
    ) -> Result<()> {
        let conversation = format!("{}\n\n{}", job.user_message, answer);
        let ctx = ctx.with_parameter("conversation", conversation.trim());
        let prompt = self.prompts.format(names::TITLE_THREAD, &ctx)?;

        let mut posts = vec![Post::system(prompt.system)];
        if !prompt.user.trim().is_empty() {
            posts.push(Post::user(prompt.user));
        }
        let req = CompletionRequest::new(posts, ctx)
            .without_tools()
            .with_max_generated_tokens(TITLE_MAX_TOKENS);
        let raw = model.chat_completion_no_stream(req).await?;
        let title = clean_title(&raw);
        if title.is_empty() {
            return Err(Error::Other("model returned an empty title".into()));
        }

        self.meta.upsert_title(&job.root_post_id, &title).await?;
        TraceEvent::TitleGenerated {
            root_post_id: job.root_post_id.clone(),
            title_chars: title.chars().count(),
        }
        .emit();
        Ok(())
    }
}

/// Run accepted records through the request's tool catalog and reject the
/// others. Every record comes back terminal.
pub async fn resolve_round(ctx: &RequestContext, pending: Vec<ToolUse>, accepted: &[String]) -> Vec<ToolUse> {
    for id in accepted {
        if !pending.iter().any(|t| &t.id == id) {
            tracing::warn!(request_id = %ctx.request_id, tool_use_id = %id, "accepted id is not pending, ignoring");
        }
    }

    let mut round = Vec::with_capacity(pending.len());
    for mut record in pending {
        if accepted.contains(&record.id) && record.accept() {
            let outcome = match &ctx.tools {
                Some(tools) => tools.resolve(&record.name, &record.arguments, ctx).await,
                None => Err(Error::UnknownTool(record.name.clone())),
            };
            if let Err(e) = &outcome {
                tracing::info!(request_id = %ctx.request_id, tool = %record.name, error = %e, "tool call failed");
            }
            record.complete(outcome.map_err(|e| e.to_string()));
        } else if !record.reject() {
            // Already terminal records keep their outcome.
            tracing::debug!(tool_use_id = %record.id, "record was not pending");
        }
        round.push(record);
    }
    round
}

/// First line of a model-written title, without surrounding quotes.
fn clean_title(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tm_domain::context::{BotSummary, UserSummary};
    use tm_domain::tool::{ToolUseStatus, REJECTED_TOOL_RESULT};
    use tm_tools::{Tool, ToolArgs, ToolStore};

    fn ctx_with_echo() -> RequestContext {
        let store = ToolStore::new();
        store.add_tools([Tool::new(
            "echo",
            "Echo the text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |_ctx: RequestContext, args: ToolArgs| async move {
                #[derive(serde::Deserialize)]
                struct A {
                    text: String,
                }
                Ok::<_, Error>(args.decode::<A>()?.text)
            },
        )]);
        RequestContext::new(UserSummary::default(), BotSummary::default()).with_tools(Arc::new(store))
    }

    #[tokio::test]
    async fn accepted_run_and_rejected_get_stock_result() {
        let pending = vec![
            ToolUse::pending("t1", "echo", json!({"text": "hi"})),
            ToolUse::pending("t2", "echo", json!({"text": "no"})),
        ];
        let round = resolve_round(&ctx_with_echo(), pending, &["t1".to_owned()]).await;

        assert_eq!(round[0].status, ToolUseStatus::Success);
        assert_eq!(round[0].result.as_deref(), Some("hi"));
        assert_eq!(round[1].status, ToolUseStatus::Rejected);
        assert_eq!(round[1].result.as_deref(), Some(REJECTED_TOOL_RESULT));
    }

    #[tokio::test]
    async fn resolver_failures_become_error_records() {
        let pending = vec![
            ToolUse::pending("t1", "echo", json!({"wrong": 1})),
            ToolUse::pending("t2", "missing", json!({})),
        ];
        let accepted = vec!["t1".to_owned(), "t2".to_owned()];
        let round = resolve_round(&ctx_with_echo(), pending, &accepted).await;

        assert_eq!(round[0].status, ToolUseStatus::Error);
        assert!(round[0].result.as_deref().unwrap().contains("echo"));
        assert_eq!(round[1].status, ToolUseStatus::Error);
        assert_eq!(round[1].result.as_deref(), Some("unknown tool: missing"));
    }

    #[tokio::test]
    async fn every_record_ends_terminal() {
        let pending = vec![
            ToolUse::pending("a", "echo", json!({"text": "1"})),
            ToolUse::pending("b", "echo", json!({"text": "2"})),
            ToolUse::pending("c", "nope", json!({})),
        ];
        let round = resolve_round(&ctx_with_echo(), pending, &["a".to_owned(), "c".to_owned()]).await;
        assert!(round.iter().all(ToolUse::is_terminal));
    }

    #[test]
    fn titles_are_cleaned() {
        assert_eq!(clean_title("\"Trip planning\"\n"), "Trip planning");
        assert_eq!(clean_title("\n\n**Budget review**\nextra"), "Budget review");
        assert_eq!(clean_title("  "), "");
    }
}
