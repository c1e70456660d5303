//! Anthropic-native adapter.
//!
//! Implements the Messages API: system text goes in the top-level `system`
//! field, turns must alternate, and tool calls and results are content
//! blocks.

use crate::network::{guarded_client, AllowedHosts};
use crate::pump::{self, PumpOptions};
use crate::registry::ProviderEnv;
use crate::sse::{sse_response_stream, SseParser};
use crate::traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
use crate::util::{error_from_response, from_reqwest, resolve_api_key, trim_base_url};
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tm_domain::capability::ModelCapabilities;
use tm_domain::config::ServiceConfig;
use tm_domain::conversation::{Post, Role};
use tm_domain::error::{Error, Result};
use tm_domain::stream::{StreamEvent, TextStream};
use tm_domain::tool::{ToolDefinition, ToolUse, ToolUseStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Image types the Messages API accepts inline.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    max_generated_tokens: u32,
    input_limit: u32,
    inactivity: Duration,
    capabilities: ModelCapabilities,
    allowed: Arc<AllowedHosts>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(id: &str, cfg: &ServiceConfig, env: &ProviderEnv) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let base_url = cfg
            .api_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(trim_base_url)
            .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string());
        let default_model = if cfg.default_model.is_empty() {
            ANTHROPIC_DEFAULT_MODEL.to_string()
        } else {
            cfg.default_model.clone()
        };

        // Unsupported image types still reach the adapter, which replaces
        // them with a text marker the model can mention.
        let capabilities = ModelCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_vision: true,
            image_types: vec!["image/*".into()],
        };

        Ok(Self {
            id: id.to_string(),
            base_url,
            api_key,
            default_model,
            max_generated_tokens: cfg.output_limit(),
            input_limit: cfg.input_limit(),
            inactivity: cfg.streaming_timeout(env.default_streaming_timeout_secs),
            capabilities,
            allowed: env.allowed_hosts.clone(),
            client: guarded_client(env.allowed_hosts.clone())?,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: reqwest::Url) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &CompletionRequest, model: &str) -> Value {
        let (system, messages) = posts_to_anthropic(&req.posts);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": req.max_generated_tokens.unwrap_or(self.max_generated_tokens),
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_anthropic).collect());
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split off the system text and merge consecutive same-role posts into
/// one multi-block message, so roles alternate.
fn posts_to_anthropic(posts: &[Post]) -> (String, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<(Role, Vec<Value>)> = Vec::new();

    for post in posts {
        let blocks = match post.role {
            Role::System => {
                if !post.message.trim().is_empty() {
                    system_parts.push(&post.message);
                }
                continue;
            }
            Role::User => user_blocks(post),
            Role::Assistant => assistant_blocks(post),
        };
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((role, existing)) if *role == post.role => existing.extend(blocks),
            _ => messages.push((post.role, blocks)),
        }
    }

    let messages = messages
        .into_iter()
        .map(|(role, content)| {
            let role = if role == Role::Assistant { "assistant" } else { "user" };
            json!({"role": role, "content": content})
        })
        .collect();
    (system_parts.join("\n\n"), messages)
}

fn user_blocks(post: &Post) -> Vec<Value> {
    let mut blocks: Vec<Value> = post
        .replayable_tool_uses()
        .map(|t| {
            json!({
                "type": "tool_result",
                "tool_use_id": t.id,
                "content": t.result.clone().unwrap_or_default(),
                "is_error": t.status != ToolUseStatus::Success,
            })
        })
        .collect();

    if !post.message.trim().is_empty() {
        blocks.push(json!({"type": "text", "text": post.message}));
    }

    for file in &post.files {
        if SUPPORTED_IMAGE_TYPES.contains(&file.mime_type.as_str()) {
            blocks.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": file.mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(&file.data),
                }
            }));
        } else {
            blocks.push(json!({
                "type": "text",
                "text": format!("[Unsupported image type: {}]", file.mime_type),
            }));
        }
    }
    blocks
}

fn assistant_blocks(post: &Post) -> Vec<Value> {
    let mut blocks = Vec::new();
    if !post.message.trim().is_empty() {
        blocks.push(json!({"type": "text", "text": post.message}));
    }
    for t in post.replayable_tool_uses() {
        let input = if t.arguments.is_object() {
            t.arguments.clone()
        } else {
            json!({})
        };
        blocks.push(json!({
            "type": "tool_use",
            "id": t.id,
            "name": t.name,
            "input": input,
        }));
    }
    blocks
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-use blocks being assembled, in block order.
struct AnthropicStreamParser {
    provider: String,
    /// (block index, id, name, partial JSON)
    active: Vec<(u64, String, String, String)>,
    finished: Vec<ToolUse>,
}

impl AnthropicStreamParser {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            active: Vec::new(),
            finished: Vec::new(),
        }
    }

    fn close(&mut self) -> Vec<Result<StreamEvent>> {
        for (_, id, name, args) in self.active.drain(..) {
            self.finished
                .push(ToolUse::pending(id, name, ToolUse::arguments_from_raw(&args)));
        }
        let calls = std::mem::take(&mut self.finished);
        if calls.is_empty() {
            vec![Ok(StreamEvent::End)]
        } else {
            vec![Ok(StreamEvent::ToolCalls(calls)), Ok(StreamEvent::End)]
        }
    }
}

impl SseParser for AnthropicStreamParser {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let index = v.get("index").and_then(Value::as_u64).unwrap_or(0);
        match v.get("type").and_then(Value::as_str).unwrap_or("") {
            "content_block_start" => {
                let block = v.get("content_block").unwrap_or(&Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let field = |k: &str| {
                        block
                            .get(k)
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string()
                    };
                    self.active
                        .push((index, field("id"), field("name"), String::new()));
                }
                Vec::new()
            }

            "content_block_delta" => {
                let delta = v.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                    "text_delta" => match delta.get("text").and_then(Value::as_str) {
                        Some(text) if !text.is_empty() => {
                            vec![Ok(StreamEvent::Text(text.to_string()))]
                        }
                        _ => Vec::new(),
                    },
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            if let Some(call) = self.active.iter_mut().find(|c| c.0 == index) {
                                call.3.push_str(partial);
                            }
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }

            "content_block_stop" => {
                if let Some(pos) = self.active.iter().position(|c| c.0 == index) {
                    let (_, id, name, args) = self.active.remove(pos);
                    self.finished
                        .push(ToolUse::pending(id, name, ToolUse::arguments_from_raw(&args)));
                }
                Vec::new()
            }

            "message_delta" => {
                let stop = v
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str);
                match stop {
                    Some(reason) => {
                        tracing::debug!(stop_reason = reason, "anthropic message finished");
                        self.close()
                    }
                    None => Vec::new(),
                }
            }

            "message_stop" => self.close(),

            "error" => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                vec![Ok(StreamEvent::Error(Error::Provider {
                    provider: self.provider.clone(),
                    message: message.to_string(),
                }))]
            }

            // ping, message_start
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<Result<StreamEvent>> {
        self.close()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LanguageModel for AnthropicProvider {
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

        let url = match self.allowed.check_url(&format!("{}/messages", self.base_url)) {
            Ok(url) => url,
            Err(e) => return pump::spawn(opts, cancel, async move { Err(e) }),
        };
        tracing::debug!(provider = %self.id, url = %url, "anthropic stream request");

        let request = self
            .authed_post(url)
            .json(&self.build_messages_body(&req, &model));
        let provider = self.id.clone();
        pump::spawn(opts, cancel, async move {
            let resp = request.send().await.map_err(from_reqwest)?;
            if !resp.status().is_success() {
                return Err(error_from_response(&provider, resp).await);
            }
            Ok(sse_response_stream(resp, AnthropicStreamParser::new(&provider)))
        })
    }

    fn input_token_limit(&self) -> u32 {
        self.input_limit
    }

    fn count_tokens(&self, text: &str) -> usize {
        crate::tokens::estimate(text)
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

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::conversation::FileAttachment;

    #[test]
    fn consecutive_same_role_posts_merge() {
        let posts = vec![
            Post::system("be nice"),
            Post::user("one"),
            Post::user("two"),
            Post::assistant("three"),
            Post::assistant("four"),
            Post::user("five"),
        ];
        let (system, msgs) = posts_to_anthropic(&posts);
        assert_eq!(system, "be nice");
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(msgs[0]["content"][1]["text"], "two");
        assert_eq!(msgs[1]["role"], "assistant");
        assert_eq!(msgs[2]["role"], "user");
        let roles: Vec<&str> = msgs.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert!(roles.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn tool_blocks_round_trip_shape() {
        let mut call = ToolUse::pending("t1", "lookup_user", json!({"username": "alice"}));
        call.accept();
        call.complete(Err("no such user".into()));
        let posts = vec![
            Post::user("who?"),
            Post::tool_calls("checking", vec![call.clone()]),
            Post::tool_results(vec![call]),
        ];
        let (_, msgs) = posts_to_anthropic(&posts);
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][1]["input"]["username"], "alice");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][0]["is_error"], true);
        assert_eq!(msgs[2]["content"][0]["content"], "no such user");
    }

    #[test]
    fn unsupported_image_becomes_marker() {
        let post = Post::user("see").with_files(vec![
            FileAttachment {
                name: "a.bmp".into(),
                mime_type: "image/bmp".into(),
                size: 1,
                data: Arc::from(&b"x"[..]),
            },
            FileAttachment {
                name: "b.png".into(),
                mime_type: "image/png".into(),
                size: 1,
                data: Arc::from(&b"x"[..]),
            },
        ]);
        let blocks = user_blocks(&post);
        assert_eq!(blocks[1]["text"], "[Unsupported image type: image/bmp]");
        assert_eq!(blocks[2]["type"], "image");
        assert_eq!(blocks[2]["source"]["media_type"], "image/png");
    }

    #[test]
    fn parses_text_then_stop() {
        let mut p = AnthropicStreamParser::new("t");
        let ev = p.parse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#);
        assert!(matches!(ev.as_slice(), [Ok(StreamEvent::Text(t))] if t == "Hi"));
        let ev = p.parse(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#);
        assert!(matches!(ev.as_slice(), [Ok(StreamEvent::End)]));
    }

    #[test]
    fn assembles_tool_use() {
        let mut p = AnthropicStreamParser::new("t");
        p.parse(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"lookup_user","input":{}}}"#);
        p.parse(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"username\":\"al"}}"#);
        p.parse(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ice\"}"}}"#);
        p.parse(r#"{"type":"content_block_stop","index":1}"#);
        let ev = p.parse(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#);
        match ev.as_slice() {
            [Ok(StreamEvent::ToolCalls(calls)), Ok(StreamEvent::End)] => {
                assert_eq!(calls[0].id, "toolu_1");
                assert_eq!(calls[0].arguments, json!({"username": "alice"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_event() {
        let mut p = AnthropicStreamParser::new("t");
        let ev = p.parse(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#);
        assert!(matches!(ev.as_slice(), [Ok(StreamEvent::Error(_))]));
    }
}
