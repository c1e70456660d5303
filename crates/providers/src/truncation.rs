//! Input-budget enforcement.
//!
//! [`truncate_posts`] is the algorithm; [`TruncatingModel`] wraps any
//! adapter and applies it to every request with the adapter's own limit.

use crate::traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
use std::sync::Arc;
use tm_domain::capability::ModelCapabilities;
use tm_domain::conversation::{Post, Role};
use tm_domain::stream::TextStream;

/// Characters removed per token of overshoot when trimming a message head.
const CHARS_PER_TOKEN: usize = 4;

/// Smallest budget ever applied.
pub const MIN_BUDGET: usize = 100;

/// Share of the remaining input limit actually used, leaving headroom for
/// tokenizer disagreement.
const BUDGET_RATIO: f64 = 0.9;

fn post_tokens(post: &Post, count: &dyn Fn(&str) -> usize) -> usize {
    let tools: usize = post
        .tool_uses
        .iter()
        .map(|t| count(&t.arguments.to_string()) + t.result.as_deref().map_or(0, count))
        .sum();
    count(&post.message) + tools
}

/// Drop the oldest posts until the total fits `budget`.
///
/// Posts are kept newest first. The oldest post that still partly fits has
/// its message head trimmed by `over * 4` characters (repeatedly, until it
/// fits) instead of being dropped. A tool-results turn never outlives the
/// call turn before it. Relative order is preserved. Returns whether
/// anything was dropped or trimmed.
pub fn truncate_posts(posts: &mut Vec<Post>, budget: usize, count: &dyn Fn(&str) -> usize) -> bool {
    let mut used = 0usize;
    let mut keep_from = posts.len();

    for i in (0..posts.len()).rev() {
        let tokens = post_tokens(&posts[i], count);
        if used + tokens <= budget {
            used += tokens;
            keep_from = i;
            continue;
        }

        let remaining = budget - used;
        if remaining > 0 && trim_head_to_fit(&mut posts[i], remaining, count) {
            keep_from = i;
        }
        // Results whose call turn is gone cannot be sent on their own.
        while posts.get(keep_from).is_some_and(Post::is_tool_results) {
            keep_from += 1;
        }
        posts.drain(..keep_from);
        return true;
    }

    false
}

/// Trim `post`'s message head until the post costs at most `remaining`.
/// Returns false when nothing useful is left.
fn trim_head_to_fit(post: &mut Post, remaining: usize, count: &dyn Fn(&str) -> usize) -> bool {
    loop {
        let tokens = post_tokens(post, count);
        if tokens <= remaining {
            return !post.is_empty();
        }
        let over = tokens - remaining;
        let chars = post.message.chars().count();
        let cut = (over * CHARS_PER_TOKEN).min(chars);
        if cut == 0 {
            return false;
        }
        post.message = post.message.chars().skip(cut).collect();
    }
}

/// Budget used for a model with `input_limit` when `reserved` tokens go to
/// tool definitions.
pub fn budget_for(input_limit: u32, reserved: usize) -> usize {
    let available = (input_limit as usize).saturating_sub(reserved);
    ((available as f64 * BUDGET_RATIO).floor() as usize).max(MIN_BUDGET)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Applies [`truncate_posts`] to every request before delegating.
///
/// Leading system posts are rotated to the end while truncating, so they
/// are the last thing to go.
pub struct TruncatingModel {
    inner: Arc<dyn LanguageModel>,
}

impl TruncatingModel {
    pub fn new(inner: Arc<dyn LanguageModel>) -> Self {
        Self { inner }
    }

    fn truncate(&self, req: &mut CompletionRequest) {
        let reserved = if req.tools.is_empty() {
            0
        } else {
            let defs = serde_json::to_string(&req.tools).unwrap_or_default();
            self.inner.count_tokens(&defs)
        };
        let budget = budget_for(self.inner.input_token_limit(), reserved);

        let system = req
            .posts
            .iter()
            .take_while(|p| p.role == Role::System)
            .count();
        req.posts.rotate_left(system);

        let inner = &self.inner;
        let count = |s: &str| inner.count_tokens(s);
        let before = req.posts.len();
        if truncate_posts(&mut req.posts, budget, &count) {
            tracing::info!(
                request_id = %req.context.request_id,
                budget,
                dropped = before - req.posts.len(),
                "conversation truncated to fit input budget"
            );
        }

        let kept_system = req
            .posts
            .iter()
            .rev()
            .take_while(|p| p.role == Role::System)
            .count()
            .min(system);
        req.posts.rotate_right(kept_system);
    }
}

#[async_trait::async_trait]
impl LanguageModel for TruncatingModel {
    fn chat_completion(&self, mut req: CompletionRequest) -> TextStream {
        self.truncate(&mut req);
        self.inner.chat_completion(req)
    }

    fn input_token_limit(&self) -> u32 {
        self.inner.input_token_limit()
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.inner.count_tokens(text)
    }

    fn default_config(&self) -> LanguageModelConfig {
        self.inner.default_config()
    }

    fn capabilities(&self) -> &ModelCapabilities {
        self.inner.capabilities()
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}
