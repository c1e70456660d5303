//! AWS Bedrock adapter (Converse stream API).
//!
//! Authenticates with a Bedrock API key sent as a bearer token, so no SigV4
//! signing is needed. Responses use the AWS event-stream framing decoded in
//! [`crate::eventstream`]. Tool use is not wired up yet: a `tool_use` stop
//! reason surfaces as an error event.

use crate::eventstream::{Frame, FrameDecoder};
use crate::network::{guarded_client, AllowedHosts};
use crate::pump::{self, PumpOptions};
use crate::registry::ProviderEnv;
use crate::traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
use crate::util::{error_from_response, from_reqwest, resolve_api_key, trim_base_url};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tm_domain::capability::ModelCapabilities;
use tm_domain::config::ServiceConfig;
use tm_domain::conversation::{Post, Role};
use tm_domain::error::{Error, Result};
use tm_domain::stream::{BoxStream, StreamEvent, TextStream};

const DEFAULT_REGION: &str = "us-east-1";

pub struct BedrockProvider {
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

impl BedrockProvider {
    pub fn from_config(id: &str, cfg: &ServiceConfig, env: &ProviderEnv) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        if cfg.default_model.is_empty() {
            return Err(Error::Config(format!(
                "{id}: default_model is required for bedrock"
            )));
        }

        let region = cfg
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION);
        let base_url = match cfg.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => trim_base_url(url),
            None => format!("https://bedrock-runtime.{region}.amazonaws.com"),
        };

        Ok(Self {
            id: id.to_string(),
            base_url,
            api_key,
            default_model: cfg.default_model.clone(),
            max_generated_tokens: cfg.output_limit(),
            input_limit: cfg.input_limit(),
            inactivity: cfg.streaming_timeout(env.default_streaming_timeout_secs),
            capabilities: ModelCapabilities {
                supports_tools: false,
                supports_streaming: true,
                supports_vision: false,
                image_types: Vec::new(),
            },
            allowed: env.allowed_hosts.clone(),
            client: guarded_client(env.allowed_hosts.clone())?,
        })
    }

    fn converse_url(&self, model: &str) -> String {
        format!("{}/model/{}/converse-stream", self.base_url, model)
    }

    fn build_converse_body(&self, req: &CompletionRequest) -> Value {
        let (system, messages) = posts_to_converse(&req.posts);
        let mut body = json!({
            "messages": messages,
            "inferenceConfig": {
                "maxTokens": req.max_generated_tokens.unwrap_or(self.max_generated_tokens),
            },
        });
        if !system.is_empty() {
            body["system"] = Value::Array(system);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// System posts become system blocks. Assistant turns without text are
/// skipped because Converse rejects empty content. Adjacent same-role turns
/// are merged, since Converse requires alternating roles.
fn posts_to_converse(posts: &[Post]) -> (Vec<Value>, Vec<Value>) {
    let mut system = Vec::new();
    let mut turns: Vec<(Role, Vec<Value>)> = Vec::new();

    for post in posts {
        if post.role == Role::System {
            if !post.message.trim().is_empty() {
                system.push(json!({"text": post.message}));
            }
            continue;
        }
        if post.message.trim().is_empty() {
            continue;
        }
        let block = json!({"text": post.message});
        match turns.last_mut() {
            Some((role, blocks)) if *role == post.role => blocks.push(block),
            _ => turns.push((post.role, vec![block])),
        }
    }

    let messages = turns
        .into_iter()
        .map(|(role, content)| {
            let role = if role == Role::Assistant { "assistant" } else { "user" };
            json!({"role": role, "content": content})
        })
        .collect();
    (system, messages)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event-stream decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn frame_events(provider: &str, frame: &Frame) -> Vec<Result<StreamEvent>> {
    let payload: Value = match serde_json::from_slice(&frame.payload) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    if frame.is_exception() {
        let message = payload
            .get("message")
            .or_else(|| payload.get("Message"))
            .and_then(Value::as_str)
            .unwrap_or("upstream exception");
        return vec![Ok(StreamEvent::Error(Error::Provider {
            provider: provider.to_string(),
            message: format!("{}: {}", frame.event_type, message),
        }))];
    }

    match frame.event_type.as_str() {
        "contentBlockDelta" => match payload
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => vec![Ok(StreamEvent::Text(text.to_string()))],
            _ => Vec::new(),
        },
        "messageStop" => {
            let reason = payload
                .get("stopReason")
                .and_then(Value::as_str)
                .unwrap_or("");
            if reason == "tool_use" {
                vec![Ok(StreamEvent::Error(Error::Provider {
                    provider: provider.to_string(),
                    message: "tool use not implemented".into(),
                }))]
            } else {
                vec![Ok(StreamEvent::End)]
            }
        }
        // messageStart, contentBlockStart/Stop, metadata
        _ => Vec::new(),
    }
}

fn converse_response_stream(
    provider: String,
    response: reqwest::Response,
) -> BoxStream<'static, Result<StreamEvent>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut decoder = FrameDecoder::new();

        'body: loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    decoder.push(&bytes);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => {
                                for event in frame_events(&provider, &frame) {
                                    let done = !matches!(&event, Ok(e) if !e.is_terminal());
                                    yield event;
                                    if done {
                                        break 'body;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                yield Err(e);
                                break 'body;
                            }
                        }
                    }
                }
                Ok(None) => {
                    if decoder.pending() > 0 {
                        tracing::warn!(bytes = decoder.pending(), "bedrock stream ended mid-frame");
                    }
                    yield Ok(StreamEvent::End);
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LanguageModel for BedrockProvider {
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

        let url = match self.allowed.check_url(&self.converse_url(&model)) {
            Ok(url) => url,
            Err(e) => return pump::spawn(opts, cancel, async move { Err(e) }),
        };

        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/vnd.amazon.eventstream")
            .json(&self.build_converse_body(&req));
        let provider = self.id.clone();
        pump::spawn(opts, cancel, async move {
            let resp = request.send().await.map_err(from_reqwest)?;
            if !resp.status().is_success() {
                return Err(error_from_response(&provider, resp).await);
            }
            Ok(converse_response_stream(provider, resp))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: &str, payload: &str) -> Frame {
        Frame {
            message_type: "event".into(),
            event_type: kind.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn system_becomes_blocks_and_empty_assistant_is_skipped() {
        let posts = vec![
            Post::system("rules"),
            Post::user("hi"),
            Post::assistant(""),
            Post::user("again"),
            Post::assistant("ok"),
        ];
        let (system, messages) = posts_to_converse(&posts);
        assert_eq!(system, vec![json!({"text": "rules"})]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[1]["content"][0]["text"], "ok");
    }

    #[test]
    fn text_delta_and_stop() {
        let ev = frame_events("b", &frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"Hel"}}"#));
        assert!(matches!(ev.as_slice(), [Ok(StreamEvent::Text(t))] if t == "Hel"));
        let ev = frame_events("b", &frame("messageStop", r#"{"stopReason":"end_turn"}"#));
        assert!(matches!(ev.as_slice(), [Ok(StreamEvent::End)]));
    }

    #[test]
    fn tool_use_stop_is_an_error() {
        let ev = frame_events("b", &frame("messageStop", r#"{"stopReason":"tool_use"}"#));
        match ev.as_slice() {
            [Ok(StreamEvent::Error(e))] => assert!(e.to_string().contains("tool use not implemented")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exception_frame_is_an_error() {
        let f = Frame {
            message_type: "exception".into(),
            event_type: "throttlingException".into(),
            payload: br#"{"message":"Too many requests"}"#.to_vec(),
        };
        match frame_events("b", &f).as_slice() {
            [Ok(StreamEvent::Error(e))] => assert!(e.to_string().contains("Too many requests")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
