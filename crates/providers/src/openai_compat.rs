//! OpenAI-compatible adapter.
//!
//! Serves the `openai`, `openai-compatible` and `azure` service kinds: same
//! chat-completions wire format, different URL layout and auth header.

use crate::network::{guarded_client, AllowedHosts};
use crate::pump::{self, PumpOptions};
use crate::registry::ProviderEnv;
use crate::sse::{sse_response_stream, SseParser};
use crate::traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
use crate::util::{error_from_response, from_reqwest, resolve_api_key, trim_base_url};
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tm_domain::capability::{ModelCapabilities, COMMON_IMAGE_TYPES};
use tm_domain::config::{ServiceConfig, ServiceKind};
use tm_domain::conversation::{Post, Role};
use tm_domain::error::{Error, Result};
use tm_domain::stream::{StreamEvent, TextStream};
use tm_domain::tool::{ToolDefinition, ToolUse};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
const AZURE_API_VERSION: &str = "2024-10-21";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapter for any endpoint following the OpenAI chat completions contract.
///
/// Azure uses `/openai/deployments/{model}/chat/completions` and an
/// `api-key` header instead of `Authorization: Bearer`.
pub struct OpenAiCompatProvider {
    id: String,
    kind: ServiceKind,
    base_url: String,
    api_key: Option<String>,
    auth_header: String,
    auth_prefix: String,
    org_id: Option<String>,
    default_model: String,
    max_generated_tokens: u32,
    input_limit: u32,
    inactivity: Duration,
    send_user_id: bool,
    capabilities: ModelCapabilities,
    allowed: Arc<AllowedHosts>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(id: &str, cfg: &ServiceConfig, env: &ProviderEnv) -> Result<Self> {
        let is_azure = cfg.kind == ServiceKind::Azure;
        let base_url = match (&cfg.api_url, cfg.kind) {
            (Some(url), _) if !url.trim().is_empty() => trim_base_url(url),
            (_, ServiceKind::Openai) => OPENAI_BASE_URL.to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "{}: api_url is required for {}",
                    id, cfg.kind
                )))
            }
        };

        // Local OpenAI-compatible servers often run without a key.
        let api_key = if cfg.kind == ServiceKind::OpenaiCompatible && !cfg.auth.is_configured() {
            None
        } else {
            Some(resolve_api_key(&cfg.auth)?)
        };

        let auth_header = cfg.auth.header.clone().unwrap_or_else(|| {
            if is_azure {
                "api-key".into()
            } else {
                "Authorization".into()
            }
        });
        let auth_prefix = cfg.auth.prefix.clone().unwrap_or_else(|| {
            if is_azure {
                String::new()
            } else {
                "Bearer ".into()
            }
        });

        let default_model = if cfg.default_model.is_empty() && cfg.kind == ServiceKind::Openai {
            OPENAI_DEFAULT_MODEL.to_string()
        } else {
            cfg.default_model.clone()
        };

        let capabilities = ModelCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_vision: true,
            image_types: COMMON_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            id: id.to_string(),
            kind: cfg.kind,
            base_url,
            api_key,
            auth_header,
            auth_prefix,
            org_id: cfg.org_id.clone().filter(|o| !o.is_empty()),
            default_model,
            max_generated_tokens: cfg.output_limit(),
            input_limit: cfg.input_limit(),
            inactivity: cfg.streaming_timeout(env.default_streaming_timeout_secs),
            send_user_id: cfg.send_user_id,
            capabilities,
            allowed: env.allowed_hosts.clone(),
            client: guarded_client(env.allowed_hosts.clone())?,
        })
    }

    // ── Internal: request construction ─────────────────────────────

    fn chat_url(&self, model: &str) -> String {
        if self.kind == ServiceKind::Azure {
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, model, AZURE_API_VERSION
            )
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn authed_post(&self, url: reqwest::Url) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(&self.auth_header, format!("{}{}", self.auth_prefix, key));
        }
        if let Some(org) = &self.org_id {
            builder = builder.header("OpenAI-Organization", org);
        }
        builder
    }

    fn build_chat_body(&self, req: &CompletionRequest, model: &str) -> Value {
        let mut body = json!({
            "messages": posts_to_openai(&req.posts),
            "stream": true,
        });

        // Azure carries the deployment in the URL.
        if self.kind != ServiceKind::Azure {
            body["model"] = Value::String(model.to_string());
        }

        let max = req.max_generated_tokens.unwrap_or(self.max_generated_tokens);
        if self.kind == ServiceKind::Openai {
            body["max_completion_tokens"] = json!(max);
        } else {
            body["max_tokens"] = json!(max);
        }

        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_openai).collect());
        }
        if self.send_user_id && !req.context.user.id.is_empty() {
            body["user"] = Value::String(req.context.user.id.clone());
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn posts_to_openai(posts: &[Post]) -> Vec<Value> {
    let mut out = Vec::with_capacity(posts.len());
    for post in posts {
        match post.role {
            Role::System => out.push(json!({"role": "system", "content": post.message})),
            Role::Assistant => {
                let calls: Vec<Value> = post
                    .replayable_tool_uses()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "type": "function",
                            "function": {"name": t.name, "arguments": t.arguments.to_string()},
                        })
                    })
                    .collect();
                if calls.is_empty() {
                    if !post.message.trim().is_empty() {
                        out.push(json!({"role": "assistant", "content": post.message}));
                    }
                } else {
                    let content = if post.message.is_empty() {
                        Value::Null
                    } else {
                        Value::String(post.message.clone())
                    };
                    out.push(json!({"role": "assistant", "content": content, "tool_calls": calls}));
                }
            }
            Role::User => {
                for result in post.replayable_tool_uses() {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.id,
                        "content": result.result.clone().unwrap_or_default(),
                    }));
                }
                if !post.message.is_empty() || !post.files.is_empty() {
                    out.push(user_to_openai(post));
                }
            }
        }
    }
    out
}

fn user_to_openai(post: &Post) -> Value {
    if post.files.is_empty() {
        return json!({"role": "user", "content": post.message});
    }
    let mut parts = vec![json!({"type": "text", "text": post.message})];
    for file in &post.files {
        let data = base64::engine::general_purpose::STANDARD.encode(&file.data);
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{};base64,{}", file.mime_type, data)},
        }));
    }
    json!({"role": "user", "content": parts})
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles streamed `tool_calls` deltas (keyed by `index`) into complete
/// tool-use records emitted once the choice finishes.
struct OpenAiStreamParser {
    provider: String,
    calls: BTreeMap<u64, PartialCall>,
}

impl OpenAiStreamParser {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            calls: BTreeMap::new(),
        }
    }

    fn close(&mut self) -> Vec<Result<StreamEvent>> {
        let calls = std::mem::take(&mut self.calls);
        if calls.is_empty() {
            return vec![Ok(StreamEvent::End)];
        }
        let uses = calls
            .into_iter()
            .map(|(idx, c)| {
                let id = if c.id.is_empty() {
                    format!("call_{idx}")
                } else {
                    c.id
                };
                ToolUse::pending(id, c.name, ToolUse::arguments_from_raw(&c.arguments))
            })
            .collect();
        vec![Ok(StreamEvent::ToolCalls(uses)), Ok(StreamEvent::End)]
    }
}

impl SseParser for OpenAiStreamParser {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return self.close();
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return vec![Ok(StreamEvent::Error(Error::Provider {
                provider: self.provider.clone(),
                message: message.to_string(),
            }))];
        }

        let Some(choice) = v
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            // Usage-only chunk.
            return Vec::new();
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Text(text.to_string())));
            }
        }

        if let Some(tc_arr) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in tc_arr {
                let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.calls.entry(idx).or_default();
                if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(function) = tc.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            events.extend(self.close());
        }

        events
    }

    fn finish(&mut self) -> Vec<Result<StreamEvent>> {
        self.close()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatProvider {
    fn chat_completion(&self, req: CompletionRequest) -> TextStream {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let opts = PumpOptions {
            provider: self.id.clone(),
            model: model.clone(),
            request_id: req.context.request_id.clone(),
            inactivity: self.inactivity,
            streaming: true,
        };
        let cancel = req.cancel.clone();

        let url = match self.allowed.check_url(&self.chat_url(&model)) {
            Ok(url) => url,
            Err(e) => return pump::spawn(opts, cancel, async move { Err(e) }),
        };
        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let request = self.authed_post(url).json(&self.build_chat_body(&req, &model));
        let provider = self.id.clone();
        pump::spawn(opts, cancel, async move {
            let resp = request.send().await.map_err(from_reqwest)?;
            if !resp.status().is_success() {
                return Err(error_from_response(&provider, resp).await);
            }
            Ok(sse_response_stream(resp, OpenAiStreamParser::new(&provider)))
        })
    }

    fn input_token_limit(&self) -> u32 {
        self.input_limit
    }

    fn count_tokens(&self, text: &str) -> usize {
        crate::tokens::count_cl100k(text)
    }

    fn default_config(&self) -> LanguageModelConfig {
        LanguageModelConfig {
            model: self.default_model.clone(),
            max_generated_tokens: self.max_generated_tokens,
        }
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
