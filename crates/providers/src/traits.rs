use tm_domain::capability::ModelCapabilities;
use tm_domain::context::RequestContext;
use tm_domain::conversation::Post;
use tm_domain::error::Result;
use tm_domain::stream::TextStream;
use tm_domain::tool::ToolDefinition;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation in order. System posts are lifted by adapters whose
    /// vendor wants them elsewhere.
    pub posts: Vec<Post>,
    pub context: RequestContext,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier override. When `None`, the adapter's default.
    pub model: Option<String>,
    /// Output cap override. When `None`, the adapter's default.
    pub max_generated_tokens: Option<u32>,
    /// Cancelling this token aborts the upstream HTTP request.
    pub cancel: CancellationToken,
}

impl CompletionRequest {
    /// A request offering every tool the context carries.
    pub fn new(posts: Vec<Post>, context: RequestContext) -> Self {
        let tools = context.tool_definitions();
        Self {
            posts,
            context,
            tools,
            model: None,
            max_generated_tokens: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn without_tools(mut self) -> Self {
        self.tools.clear();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_generated_tokens(mut self, max: u32) -> Self {
        self.max_generated_tokens = Some(max);
        self
    }
}

/// Defaults an adapter applies when the request does not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageModelConfig {
    pub model: String,
    pub max_generated_tokens: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter implements.
///
/// Implementations translate between [`Post`]s and a vendor's wire format
/// and turn its response into canonical stream events.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a completion. Returns immediately; a background task feeds the
    /// stream and closes it after exactly one terminal event.
    fn chat_completion(&self, req: CompletionRequest) -> TextStream;

    /// Run a completion to the end and return its text.
    async fn chat_completion_no_stream(&self, req: CompletionRequest) -> Result<String> {
        self.chat_completion(req).read_all().await
    }

    /// Input budget in tokens.
    fn input_token_limit(&self) -> u32;

    /// Token estimate for `text` under this model's tokenizer.
    fn count_tokens(&self, text: &str) -> usize;

    fn default_config(&self) -> LanguageModelConfig;

    fn capabilities(&self) -> &ModelCapabilities;

    /// Identifier used in logs and trace events.
    fn provider_id(&self) -> &str;
}
