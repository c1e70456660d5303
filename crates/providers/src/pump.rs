//! Drives a vendor stream into a completion channel.
//!
//! One task per completion: it opens the upstream request, forwards events
//! in order, and enforces cancellation and the inter-event timeout. The
//! task ends after the first terminal event, which drops the HTTP response
//! and with it the upstream connection.

use futures_util::StreamExt;
use std::future::Future;
use std::time::{Duration, Instant};
use tm_domain::error::{Error, Result};
use tm_domain::stream::{BoxStream, EventSender, StreamEvent, TextStream};
use tm_domain::trace::TraceEvent;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Shortest wait for the first byte of a response. Models may think for a
/// while before the first token even when later tokens arrive quickly.
const MIN_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct PumpOptions {
    pub provider: String,
    pub model: String,
    pub request_id: String,
    pub inactivity: Duration,
    pub streaming: bool,
}

impl PumpOptions {
    fn open_timeout(&self) -> Duration {
        self.inactivity.max(MIN_OPEN_TIMEOUT)
    }
}

pub(crate) fn spawn<Fut>(opts: PumpOptions, cancel: CancellationToken, open: Fut) -> TextStream
where
    Fut: Future<Output = Result<BoxStream<'static, Result<StreamEvent>>>> + Send + 'static,
{
    let (tx, rx) = TextStream::channel();
    let span = tracing::info_span!(
        "llm.call",
        provider = %opts.provider,
        model = %opts.model,
        request_id = %opts.request_id,
    );
    tokio::spawn(drive(opts, cancel, open, tx).instrument(span));
    rx
}

async fn drive<Fut>(opts: PumpOptions, cancel: CancellationToken, open: Fut, mut tx: EventSender)
where
    Fut: Future<Output = Result<BoxStream<'static, Result<StreamEvent>>>> + Send + 'static,
{
    let started = Instant::now();
    let outcome = forward(&opts, &cancel, open, &mut tx).await;
    tracing::debug!(outcome, elapsed_ms = started.elapsed().as_millis() as u64, "llm call finished");
    TraceEvent::LlmRequest {
        request_id: opts.request_id.clone(),
        provider: opts.provider.clone(),
        model: opts.model.clone(),
        streaming: opts.streaming,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome: outcome.to_string(),
    }
    .emit();
}

async fn forward<Fut>(
    opts: &PumpOptions,
    cancel: &CancellationToken,
    open: Fut,
    tx: &mut EventSender,
) -> &'static str
where
    Fut: Future<Output = Result<BoxStream<'static, Result<StreamEvent>>>> + Send + 'static,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tx.error(Error::Cancelled).await;
            return "cancelled";
        }
        r = tokio::time::timeout(opts.open_timeout(), open) => r,
    };

    let mut stream = match opened {
        Err(_) => {
            tracing::warn!("upstream did not respond before the open timeout");
            tx.error(Error::StreamInactive).await;
            return "inactive";
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "upstream request failed");
            tx.error(e).await;
            return "error";
        }
        Ok(Ok(stream)) => stream,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tx.error(Error::Cancelled).await;
                return "cancelled";
            }
            r = tokio::time::timeout(opts.inactivity, stream.next()) => r,
        };

        match next {
            Err(_) => {
                tracing::warn!(timeout_secs = opts.inactivity.as_secs(), "stream inactive");
                tx.error(Error::StreamInactive).await;
                return "inactive";
            }
            Ok(None) => {
                tx.end().await;
                return "ok";
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "upstream stream failed");
                tx.error(e).await;
                return "error";
            }
            Ok(Some(Ok(event))) => {
                let outcome = match &event {
                    StreamEvent::End => Some("ok"),
                    StreamEvent::Error(_) => Some("error"),
                    StreamEvent::ToolCalls(_) | StreamEvent::Text(_) => None,
                };
                if !tx.send(event).await {
                    return "abandoned";
                }
                if let Some(outcome) = outcome {
                    return outcome;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(inactivity: Duration) -> PumpOptions {
        PumpOptions {
            provider: "test".into(),
            model: "m".into(),
            request_id: "r".into(),
            inactivity,
            streaming: true,
        }
    }

    fn boxed(events: Vec<Result<StreamEvent>>) -> BoxStream<'static, Result<StreamEvent>> {
        Box::pin(futures_util::stream::iter(events))
    }

    #[tokio::test]
    async fn forwards_until_end() {
        let rx = spawn(opts(Duration::from_secs(1)), CancellationToken::new(), async {
            Ok(boxed(vec![
                Ok(StreamEvent::Text("a".into())),
                Ok(StreamEvent::Text("b".into())),
                Ok(StreamEvent::End),
                Ok(StreamEvent::Text("ignored".into())),
            ]))
        });
        assert_eq!(rx.read_all().await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn open_error_becomes_error_event() {
        let mut rx = spawn(opts(Duration::from_secs(1)), CancellationToken::new(), async {
            Err(Error::Http("refused".into()))
        });
        assert!(matches!(rx.recv().await, Some(StreamEvent::Error(Error::Http(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_yields_stream_inactive() {
        let mut rx = spawn(opts(Duration::from_secs(10)), CancellationToken::new(), async {
            let s = async_stream::stream! {
                yield Ok(StreamEvent::Text("first".into()));
                tokio::time::sleep(Duration::from_secs(30)).await;
                yield Ok(StreamEvent::End);
            };
            Ok(Box::pin(s) as BoxStream<'static, Result<StreamEvent>>)
        });
        assert!(matches!(rx.recv().await, Some(StreamEvent::Text(_))));
        let ev = rx.recv().await;
        assert!(matches!(ev, Some(StreamEvent::Error(Error::StreamInactive))), "{ev:?}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_terminates_stream() {
        let cancel = CancellationToken::new();
        let mut rx = spawn(opts(Duration::from_secs(10)), cancel.clone(), async {
            let s = async_stream::stream! {
                yield Ok(StreamEvent::Text("first".into()));
                futures_util::future::pending::<()>().await;
                yield Ok(StreamEvent::End);
            };
            Ok(Box::pin(s) as BoxStream<'static, Result<StreamEvent>>)
        });
        assert!(matches!(rx.recv().await, Some(StreamEvent::Text(_))));
        cancel.cancel();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Error(Error::Cancelled))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn body_close_without_end_still_ends() {
        let mut rx = spawn(opts(Duration::from_secs(1)), CancellationToken::new(), async {
            Ok(boxed(vec![Ok(StreamEvent::Text("x".into()))]))
        });
        assert!(matches!(rx.recv().await, Some(StreamEvent::Text(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End)));
        assert!(rx.recv().await.is_none());
    }
}
