//! Test doubles shared by threadmind's unit and integration tests.
//!
//! [`ScriptedModel`] stands in for a provider: every completion replays the
//! next queued script and the request's posts are recorded for assertions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tm_domain::capability::ModelCapabilities;
use tm_domain::conversation::Post;
use tm_domain::error::Error;
use tm_domain::stream::{StreamEvent, TextStream};
use tm_domain::tool::ToolUse;
use tm_providers::{CompletionRequest, LanguageModel, LanguageModelConfig};

/// One event of a scripted completion.
pub enum Step {
    Text(&'static str),
    Calls(Vec<ToolUse>),
    /// End the stream with this error.
    Fail(Error),
    /// Block until the request is cancelled.
    Hang,
}

/// Replays one queued script per call and records every request. An empty
/// queue answers "ok".
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<Vec<Post>>>,
    input_limit: u32,
    caps: ModelCapabilities,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::with_input_limit(100_000)
    }

    pub fn with_input_limit(input_limit: u32) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            input_limit,
            caps: ModelCapabilities {
                supports_tools: true,
                supports_streaming: true,
                ..Default::default()
            },
        }
    }

    pub fn push(&self, script: Vec<Step>) {
        self.scripts.lock().push_back(script);
    }

    pub fn requests(&self) -> Vec<Vec<Post>> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn chat_completion(&self, req: CompletionRequest) -> TextStream {
        self.requests.lock().push(req.posts.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Text("ok")]);
        let cancel = req.cancel.clone();
        let (mut tx, rx) = TextStream::channel();
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Text(t) => {
                        tx.text(t).await;
                    }
                    Step::Calls(calls) => {
                        tx.send(StreamEvent::ToolCalls(calls)).await;
                    }
                    Step::Fail(e) => {
                        tx.error(e).await;
                        return;
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        tx.error(Error::Cancelled).await;
                        return;
                    }
                }
            }
            tx.end().await;
        });
        rx
    }

    fn input_token_limit(&self) -> u32 {
        self.input_limit
    }

    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    fn default_config(&self) -> LanguageModelConfig {
        LanguageModelConfig {
            model: "scripted".into(),
            max_generated_tokens: 1024,
        }
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.caps
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}
