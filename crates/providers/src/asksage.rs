//! AskSage adapter.
//!
//! AskSage has no streaming endpoint. The whole answer is fetched with one
//! `/server/query` call and delivered as a single text chunk followed by
//! `End`, through the same pump as the streaming adapters. Authentication
//! exchanges the account email and API key for a short-lived access token,
//! cached until the server rejects it.

use crate::network::{guarded_client, AllowedHosts};
use crate::pump::{self, PumpOptions};
use crate::registry::ProviderEnv;
use crate::traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
use crate::util::{error_from_response, from_reqwest, resolve_api_key, trim_base_url};
use futures_util::stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tm_domain::capability::ModelCapabilities;
use tm_domain::config::ServiceConfig;
use tm_domain::conversation::{Post, Role};
use tm_domain::error::{Error, Result};
use tm_domain::stream::{BoxStream, StreamEvent, TextStream};

const ASKSAGE_BASE_URL: &str = "https://api.asksage.ai";
const ASKSAGE_DEFAULT_MODEL: &str = "gpt-4o";

pub struct AskSageProvider {
    inner: Arc<Inner>,
    default_model: String,
    max_generated_tokens: u32,
    input_limit: u32,
    inactivity: Duration,
    capabilities: ModelCapabilities,
}

/// State shared with the spawned request task.
struct Inner {
    id: String,
    base_url: String,
    email: String,
    api_key: String,
    token: Mutex<Option<String>>,
    allowed: Arc<AllowedHosts>,
    client: reqwest::Client,
}

impl AskSageProvider {
    pub fn from_config(id: &str, cfg: &ServiceConfig, env: &ProviderEnv) -> Result<Self> {
        let email = cfg
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config(format!("{id}: username is required for asksage")))?;
        let api_key = resolve_api_key(&cfg.auth)?;
        let base_url = cfg
            .api_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(trim_base_url)
            .unwrap_or_else(|| ASKSAGE_BASE_URL.to_string());
        let default_model = if cfg.default_model.is_empty() {
            ASKSAGE_DEFAULT_MODEL.to_string()
        } else {
            cfg.default_model.clone()
        };

        Ok(Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                base_url,
                email,
                api_key,
                token: Mutex::new(None),
                allowed: env.allowed_hosts.clone(),
                client: guarded_client(env.allowed_hosts.clone())?,
            }),
            default_model,
            max_generated_tokens: cfg.output_limit(),
            input_limit: cfg.input_limit(),
            inactivity: cfg.streaming_timeout(env.default_streaming_timeout_secs),
            capabilities: ModelCapabilities {
                supports_tools: false,
                supports_streaming: false,
                supports_vision: false,
                image_types: Vec::new(),
            },
        })
    }
}

impl Inner {
    fn url(&self, path: &str) -> Result<reqwest::Url> {
        self.allowed.check_url(&format!("{}{}", self.base_url, path))
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.token.lock().clone() {
            return Ok(token);
        }

        let resp = self
            .client
            .post(self.url("/user/get-token-with-api-key")?)
            .json(&json!({"email": self.email, "api_key": self.api_key}))
            .send()
            .await
            .map_err(from_reqwest)?;
        if !resp.status().is_success() {
            return Err(error_from_response(&self.id, resp).await);
        }
        let body: Value = resp.json().await.map_err(from_reqwest)?;
        let token = body
            .pointer("/response/access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth(format!("{}: token response had no access_token", self.id)))?
            .to_string();

        tracing::debug!(provider = %self.id, "obtained asksage access token");
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    async fn query(&self, body: Value) -> Result<String> {
        let url = self.url("/server/query")?;
        let token = self.access_token().await?;

        let resp = self
            .client
            .post(url)
            .header("x-access-tokens", token)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.token.lock().take();
        }
        if !resp.status().is_success() {
            return Err(error_from_response(&self.id, resp).await);
        }

        let body: Value = resp.json().await.map_err(from_reqwest)?;
        body.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Provider {
                provider: self.id.clone(),
                message: "query response had no message".into(),
            })
    }
}

/// User and assistant turns become `me`/`gpt` messages; system posts are
/// joined into `system_prompt`.
fn build_query_body(posts: &[Post], model: &str) -> Value {
    let mut system = Vec::new();
    let mut messages = Vec::new();
    for post in posts {
        match post.role {
            Role::System => system.push(post.message.as_str()),
            Role::User => messages.push(json!({"user": "me", "message": post.message})),
            Role::Assistant => messages.push(json!({"user": "gpt", "message": post.message})),
        }
    }
    json!({
        "message": messages,
        "model": model,
        "system_prompt": system.join("\n"),
        "dataset": "none",
    })
}

fn one_chunk(text: String) -> BoxStream<'static, Result<StreamEvent>> {
    let mut events = Vec::with_capacity(2);
    if !text.is_empty() {
        events.push(Ok(StreamEvent::Text(text)));
    }
    events.push(Ok(StreamEvent::End));
    Box::pin(stream::iter(events))
}

#[async_trait::async_trait]
impl LanguageModel for AskSageProvider {
    fn chat_completion(&self, req: CompletionRequest) -> TextStream {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let opts = PumpOptions {
            provider: self.inner.id.clone(),
            model: model.clone(),
            request_id: req.context.request_id.clone(),
            inactivity: self.inactivity,
            streaming: false,
        };
        let body = build_query_body(&req.posts, &model);
        let inner = self.inner.clone();
        pump::spawn(opts, req.cancel.clone(), async move {
            inner.query(body).await.map(one_chunk)
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
        &self.inner.id
    }
}
