//! Streams completion events into a chat post.
//!
//! Text is batched: the post is updated at most once per flush interval
//! unless the unflushed text grows past the byte threshold. The final
//! state is written before the writer returns, unless a newer stream has
//! taken over the post.

use crate::notices::{self, Notice};
use crate::streams::{StreamContexts, StreamHandle};
use std::sync::Arc;
use std::time::Duration;
use tm_domain::config::StreamingConfig;
use tm_domain::error::Error;
use tm_domain::host::{props, HostClient, HostPost};
use tm_domain::stream::{StreamEvent, TextStream};
use tm_domain::trace::TraceEvent;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Completed,
    /// The model asked for tools; the calls are parked on the post.
    ToolCallsPending,
    Failed,
    Cancelled,
}

impl WriteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteStatus::Completed => "completed",
            WriteStatus::ToolCallsPending => "tool_calls_pending",
            WriteStatus::Failed => "failed",
            WriteStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct WriteOutcome {
    /// The post as last written.
    pub post: HostPost,
    pub status: WriteStatus,
    /// Text received from the model during this write.
    pub text: String,
}

pub struct StreamWriter {
    host: Arc<dyn HostClient>,
    contexts: Arc<StreamContexts>,
    config: StreamingConfig,
}

impl StreamWriter {
    pub fn new(host: Arc<dyn HostClient>, contexts: Arc<StreamContexts>, config: StreamingConfig) -> Self {
        Self {
            host,
            contexts,
            config,
        }
    }

    pub fn contexts(&self) -> &Arc<StreamContexts> {
        &self.contexts
    }

    /// Consume `stream` into `post`.
    ///
    /// Text already in the post is kept and new text goes after it, which
    /// is how a resubmitted tool round continues an answer. `handle` is
    /// released when this returns, whatever the outcome.
    pub async fn write(
        &self,
        post: HostPost,
        mut stream: TextStream,
        handle: StreamHandle,
        locale: &str,
    ) -> WriteOutcome {
        let mut buf = PostBuffer::new(post);
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let status = loop {
            tokio::select! {
                biased;
                _ = handle.token.cancelled() => break WriteStatus::Cancelled,
                event = stream.recv() => match event {
                    Some(StreamEvent::Text(chunk)) => {
                        buf.push(&chunk);
                        if buf.unflushed >= self.config.flush_bytes {
                            self.flush(&mut buf).await;
                        }
                    }
                    Some(StreamEvent::ToolCalls(calls)) => {
                        tracing::debug!(post_id = %buf.post.id, count = calls.len(), "parking tool calls");
                        match serde_json::to_value(&calls) {
                            Ok(value) => buf.post.set_prop(props::PENDING_TOOL_CALLS, value),
                            Err(e) => tracing::error!(post_id = %buf.post.id, error = %e, "cannot serialize tool calls"),
                        }
                        break WriteStatus::ToolCallsPending;
                    }
                    Some(StreamEvent::Error(Error::Cancelled)) => break WriteStatus::Cancelled,
                    Some(StreamEvent::Error(err)) => {
                        tracing::warn!(post_id = %buf.post.id, error = %err, "completion failed");
                        buf.replace(notices::for_error(&err, locale));
                        break WriteStatus::Failed;
                    }
                    Some(StreamEvent::End) => break WriteStatus::Completed,
                    None => {
                        tracing::warn!(post_id = %buf.post.id, "completion stream closed without end");
                        buf.replace(notices::text(Notice::GenericError, locale));
                        break WriteStatus::Failed;
                    }
                },
                _ = ticker.tick(), if buf.unflushed > 0 => self.flush(&mut buf).await,
            }
        };

        let superseded = status == WriteStatus::Cancelled && !self.contexts.is_current(&handle);
        if superseded {
            // A newer stream owns the post now.
            tracing::debug!(post_id = %buf.post.id, "stream superseded, leaving post to its successor");
        } else {
            if status == WriteStatus::Cancelled {
                buf.push_notice(notices::text(Notice::Cancelled, locale));
            }
            self.flush(&mut buf).await;
            self.contexts.remove(&handle);
        }

        TraceEvent::StreamFinished {
            post_id: buf.post.id.clone(),
            outcome: status.as_str().to_owned(),
            chars: buf.received.chars().count(),
        }
        .emit();

        WriteOutcome {
            post: buf.post,
            status,
            text: buf.received,
        }
    }

    async fn flush(&self, buf: &mut PostBuffer) {
        buf.post.message = buf.message();
        match self.host.update_post(buf.post.clone()).await {
            Ok(updated) => buf.post = updated,
            Err(e) => tracing::warn!(post_id = %buf.post.id, error = %e, "post update failed"),
        }
        buf.unflushed = 0;
    }
}

/// The post under construction.
struct PostBuffer {
    post: HostPost,
    /// Text the post held before this write.
    prefix: String,
    received: String,
    /// Replaces everything once set.
    notice: Option<String>,
    unflushed: usize,
}

impl PostBuffer {
    fn new(post: HostPost) -> Self {
        Self {
            prefix: post.message.clone(),
            post,
            received: String::new(),
            notice: None,
            unflushed: 0,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.received.push_str(chunk);
        self.unflushed += chunk.len();
    }

    fn replace(&mut self, notice: &str) {
        self.notice = Some(notice.to_owned());
    }

    fn push_notice(&mut self, notice: &str) {
        let text = self.text();
        self.notice = Some(if text.is_empty() {
            notice.to_owned()
        } else {
            format!("{text}\n\n{notice}")
        });
    }

    fn text(&self) -> String {
        match (self.prefix.is_empty(), self.received.is_empty()) {
            (true, _) => self.received.clone(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}\n\n{}", self.prefix, self.received),
        }
    }

    fn message(&self) -> String {
        self.notice.clone().unwrap_or_else(|| self.text())
    }
}
