//! Shared SSE streaming infrastructure.
//!
//! LLM adapters receive a `reqwest::Response`, buffer chunks, split on blank
//! lines, and feed each `data:` payload to a vendor-specific parser. The MCP
//! transport reuses [`drain_events`] because it also needs event names.

use crate::util::from_reqwest;
use tm_domain::error::Result;
use tm_domain::stream::{BoxStream, StreamEvent};

/// One SSE event block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Append raw bytes to an SSE buffer, normalizing CRLF line endings.
pub fn push_chunk(buffer: &mut String, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    if text.contains('\r') {
        buffer.push_str(&text.replace("\r\n", "\n"));
    } else {
        buffer.push_str(&text);
    }
}

/// Extract complete events from an SSE buffer.
///
/// Events are delimited by `\n\n`. The buffer is drained in place: any
/// trailing partial event remains for the next call. Blocks without data
/// (comments, keep-alives) are skipped.
pub fn drain_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(d) = line.strip_prefix("data:") {
                let d = d.trim();
                if !d.is_empty() {
                    data.push(d);
                }
            }
        }
        if !data.is_empty() {
            events.push(SseEvent {
                event,
                data: data.join("\n"),
            });
        }
    }

    events
}

/// `data:` payloads only.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    drain_events(buffer).into_iter().map(|e| e.data).collect()
}

/// Vendor-specific payload parser.
///
/// Adapters keep state across payloads (tool-call assembly), hence `&mut`.
pub(crate) trait SseParser: Send + 'static {
    /// Events for one `data:` payload.
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>>;

    /// Events to emit when the body closes before a terminal event.
    fn finish(&mut self) -> Vec<Result<StreamEvent>> {
        vec![Ok(StreamEvent::End)]
    }
}

fn is_final(event: &Result<StreamEvent>) -> bool {
    match event {
        Ok(e) => e.is_terminal(),
        Err(_) => true,
    }
}

/// Build a stream of canonical events from an SSE response and a parser.
///
/// Stops after the first terminal event. When the body closes early the
/// remaining buffer is flushed and the parser's [`SseParser::finish`]
/// events close the stream.
pub(crate) fn sse_response_stream<P: SseParser>(
    response: reqwest::Response,
    mut parser: P,
) -> BoxStream<'static, Result<StreamEvent>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut finished = false;

        while !finished {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    push_chunk(&mut buffer, &bytes);
                    for data in drain_data_lines(&mut buffer) {
                        for event in parser.parse(&data) {
                            finished = is_final(&event);
                            yield event;
                            if finished {
                                break;
                            }
                        }
                        if finished {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    buffer.push_str("\n\n");
                    for data in drain_data_lines(&mut buffer) {
                        for event in parser.parse(&data) {
                            finished = is_final(&event);
                            yield event;
                            if finished {
                                break;
                            }
                        }
                        if finished {
                            break;
                        }
                    }
                    if !finished {
                        for event in parser.finish() {
                            finished = is_final(&event);
                            yield event;
                            if finished {
                                break;
                            }
                        }
                    }
                    if !finished {
                        yield Ok(StreamEvent::End);
                    }
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
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"hello\":\"world\"}\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"hello\":\"world\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn drain_skips_keepalives() {
        let mut buf = String::from(": ping\n\ndata: \n\nevent: ping\n\n");
        assert!(drain_events(&mut buf).is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn multi_line_data_joined() {
        let mut buf = String::from("data: a\ndata: b\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["a\nb"]);
    }

    #[test]
    fn crlf_normalized() {
        let mut buf = String::new();
        push_chunk(&mut buf, b"event: endpoint\r\ndata: /messages?id=1\r\n\r\n");
        let events = drain_events(&mut buf);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?id=1");
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_data_lines(&mut buf).is_empty());
        buf.push_str("\n\ndata: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["chunk1", "[DONE]"]);
        assert!(buf.is_empty());
    }
}
