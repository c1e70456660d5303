use crate::error::{Error, Result};
use crate::tool::ToolUse;
use std::pin::Pin;
use tokio::sync::mpsc;

/// A boxed async stream, used for raw provider byte/event streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Capacity of every completion event channel. Small on purpose: a slow
/// reader stalls the producer, which in turn stops reading the upstream body.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Provider-neutral streaming event.
///
/// Within one completion events arrive in provider order; `Error` and `End`
/// are terminal and at most one of them is ever delivered.
#[derive(Debug)]
pub enum StreamEvent {
    /// A text chunk.
    Text(String),
    /// The model asked for tools. All records are `pending`.
    ToolCalls(Vec<ToolUse>),
    /// The completion failed.
    Error(Error),
    /// The completion finished normally.
    End,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::End)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel halves
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Producer half of a completion channel.
///
/// Refuses everything after the first terminal event, so a producer cannot
/// emit both an error and an end.
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
    finished: bool,
}

impl EventSender {
    /// Send one event. Returns `false` when the event was dropped, either
    /// because a terminal event was already sent or the reader went away.
    pub async fn send(&mut self, event: StreamEvent) -> bool {
        if self.finished {
            return false;
        }
        if event.is_terminal() {
            self.finished = true;
        }
        self.tx.send(event).await.is_ok()
    }

    pub async fn text(&mut self, chunk: impl Into<String>) -> bool {
        self.send(StreamEvent::Text(chunk.into())).await
    }

    pub async fn error(&mut self, err: Error) -> bool {
        self.send(StreamEvent::Error(err)).await
    }

    pub async fn end(&mut self) -> bool {
        self.send(StreamEvent::End).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True once the reader dropped its half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a completion channel.
#[derive(Debug)]
pub struct TextStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TextStream {
    pub fn channel() -> (EventSender, TextStream) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            EventSender {
                tx,
                finished: false,
            },
            TextStream { rx },
        )
    }

    /// A stream that yields `text` as a single chunk and ends.
    pub fn from_text(text: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(StreamEvent::Text(text.into()));
        let _ = tx.try_send(StreamEvent::End);
        TextStream { rx }
    }

    /// A stream that yields only `err`.
    pub fn from_error(err: Error) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(StreamEvent::Error(err));
        TextStream { rx }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into one string. Tool-call events are ignored since
    /// callers of this helper never offer tools.
    pub async fn read_all(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Text(chunk) => out.push_str(&chunk),
                StreamEvent::ToolCalls(calls) => {
                    tracing::debug!(count = calls.len(), "ignoring tool calls in non-streaming read");
                }
                StreamEvent::Error(err) => return Err(err),
                StreamEvent::End => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_refuses_after_terminal() {
        let (mut tx, mut rx) = TextStream::channel();
        assert!(tx.text("a").await);
        assert!(tx.error(Error::StreamInactive).await);
        assert!(!tx.end().await);
        assert!(!tx.text("late").await);
        drop(tx);

        assert!(matches!(rx.recv().await, Some(StreamEvent::Text(t)) if t == "a"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Error(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_all_concatenates() {
        let (mut tx, rx) = TextStream::channel();
        tokio::spawn(async move {
            tx.text("Hel").await;
            tx.text("lo").await;
            tx.end().await;
        });
        assert_eq!(rx.read_all().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn read_all_surfaces_error() {
        let err = TextStream::from_error(Error::Other("boom".into()))
            .read_all()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn from_text_is_one_chunk() {
        let mut s = TextStream::from_text("whole");
        assert!(matches!(s.recv().await, Some(StreamEvent::Text(t)) if t == "whole"));
        assert!(matches!(s.recv().await, Some(StreamEvent::End)));
        assert!(s.recv().await.is_none());
    }
}
