//! MCP transport layer.
//!
//! Remote tool servers speak the SSE flavour of MCP: the client keeps one
//! `GET` stream open, the server's first `endpoint` event names the URL to
//! POST JSON-RPC messages to, and responses arrive later as `message`
//! events on the stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tm_domain::config::McpServerConfig;
use tm_providers::network::AllowedHosts;
use tm_providers::sse::{drain_events, push_chunk};

use crate::protocol::{Envelope, Method, Reply};

/// Header carrying the requesting user's id on every request.
pub const USER_ID_HEADER: &str = "x-threadmind-user-id";

/// How long to wait for the server's `endpoint` event.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait up to `timeout` for its reply.
    async fn send_request(
        &self,
        method: Method,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, TransportError>;

    /// Send a notification; no reply is expected.
    async fn send_notification(&self, method: Method) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Shut down the transport.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("upstream host {0} is not on allowed list")]
    HostNotAllowed(String),

    #[error("event stream closed")]
    Closed,

    #[error("timeout waiting for response")]
    Timeout,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// One SSE session with one server on behalf of one user.
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    allowed: Arc<AllowedHosts>,
    endpoint: reqwest::Url,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        config: &McpServerConfig,
        user_id: &str,
        client: reqwest::Client,
        allowed: Arc<AllowedHosts>,
    ) -> Result<Self, TransportError> {
        let url = check_url(&allowed, &config.url)?;
        let headers = build_headers(config, user_id)?;

        let resp = client
            .get(url.clone())
            .headers(headers.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(
            resp,
            endpoint_tx,
            pending.clone(),
            alive.clone(),
        ));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(path)) => path,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::Closed);
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Timeout);
            }
        };
        let endpoint = url
            .join(&endpoint)
            .map_err(|e| TransportError::InvalidUrl(format!("{endpoint}: {e}")))?;
        let endpoint = check_url(&allowed, endpoint.as_str())?;
        tracing::debug!(server_id = %config.id, endpoint = %endpoint, "MCP session open");

        Ok(Self {
            client,
            headers,
            allowed,
            endpoint,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, body: String) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        // The allow-list may have been narrowed by a config reload.
        if let Some(host) = self.endpoint.host_str() {
            if !self.allowed.permits(host) {
                return Err(TransportError::HostNotAllowed(host.to_string()));
            }
        }
        let resp = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(
        &self,
        method: Method,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&Envelope::request(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        tracing::debug!(id, method = method.as_str(), "sending MCP request");
        if let Err(e) = self.post(json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: Method) -> Result<(), TransportError> {
        let json = serde_json::to_string(&Envelope::notification(method))?;
        tracing::debug!(method = method.as_str(), "sending MCP notification");
        self.post(json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // Dropping the senders wakes every waiter with `Closed`.
        self.pending.lock().clear();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn check_url(allowed: &AllowedHosts, url: &str) -> Result<reqwest::Url, TransportError> {
    allowed.check_url(url).map_err(|e| match e {
        tm_domain::error::Error::HostNotAllowed { host } => TransportError::HostNotAllowed(host),
        other => TransportError::InvalidUrl(other.to_string()),
    })
}

fn build_headers(config: &McpServerConfig, user_id: &str) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    let invalid = |what: &str| TransportError::InvalidUrl(format!("invalid header {what}"));
    for (name, value) in &config.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?,
            HeaderValue::from_str(value).map_err(|_| invalid(name))?,
        );
    }
    headers.insert(
        USER_ID_HEADER,
        HeaderValue::from_str(user_id).map_err(|_| invalid(USER_ID_HEADER))?,
    );
    Ok(headers)
}

/// Reads the event stream until it closes, routing responses to waiters.
async fn read_events(
    mut resp: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: Pending,
    alive: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut buffer = String::new();

    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "MCP event stream failed");
                break;
            }
        };
        push_chunk(&mut buffer, &chunk);

        for event in drain_events(&mut buffer) {
            match event.event.as_deref() {
                Some("endpoint") => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                Some("message") | None => match Reply::from_event(&event.data) {
                    Some(reply) => {
                        let waiter = pending.lock().remove(&reply.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => tracing::debug!(id = reply.id, "reply with no waiter"),
                        }
                    }
                    None => tracing::debug!(data = %event.data, "skipping non-reply MCP message"),
                },
                Some(other) => tracing::debug!(event = other, "ignoring MCP event"),
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_user_id_and_extras() {
        let config = McpServerConfig {
            id: "s".into(),
            url: "http://localhost/sse".into(),
            headers: HashMap::from([("X-Team".to_string(), "eng".to_string())]),
        };
        let headers = build_headers(&config, "u1").unwrap();
        assert_eq!(headers[USER_ID_HEADER], "u1");
        assert_eq!(headers["x-team"], "eng");
    }

    #[test]
    fn blocked_server_url() {
        let allowed = AllowedHosts::new(["tools.example.com"]);
        let err = check_url(&allowed, "https://evil.example/sse").unwrap_err();
        assert!(matches!(err, TransportError::HostNotAllowed(h) if h == "evil.example"));
    }
}
