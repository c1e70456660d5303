//! AWS event-stream framing.
//!
//! Bedrock's streaming endpoints reply with `application/vnd.amazon.eventstream`
//! bodies instead of SSE. Each frame is:
//!
//! ```text
//! [total_len:4][headers_len:4][prelude_crc:4][headers...][payload...][message_crc:4]
//! ```
//!
//! Both CRC32 checksums are verified. A mismatch means the decoder has lost
//! frame alignment, so it is reported as an error rather than resynced.

use tm_domain::error::{Error, Result};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
/// Frames above this size are treated as corrupt framing.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One decoded frame with the headers this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    /// `:message-type`, usually `event` or `exception`.
    pub message_type: String,
    /// `:event-type` or `:exception-type`.
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_exception(&self) -> bool {
        self.message_type == "exception" || self.message_type == "error"
    }
}

/// Incremental decoder; feed body chunks, pull complete frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let prelude_crc = read_u32(&self.buffer[8..12]);
        if crc32fast::hash(&self.buffer[0..8]) != prelude_crc {
            return Err(Error::Other("event-stream prelude checksum mismatch".into()));
        }
        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;

        if total_len < PRELUDE_LEN + TRAILER_LEN
            || total_len > MAX_FRAME_LEN
            || PRELUDE_LEN + headers_len > total_len - TRAILER_LEN
        {
            return Err(Error::Other(format!(
                "malformed event-stream frame (total {total_len}, headers {headers_len})"
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let payload_end = total_len - TRAILER_LEN;
        let message_crc = read_u32(&self.buffer[payload_end..total_len]);
        if crc32fast::hash(&self.buffer[..payload_end]) != message_crc {
            return Err(Error::Other("event-stream message checksum mismatch".into()));
        }
        let headers = parse_headers(&self.buffer[PRELUDE_LEN..headers_end])?;
        let payload = self.buffer[headers_end..payload_end].to_vec();
        self.buffer.drain(..total_len);

        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let message_type = lookup(":message-type").unwrap_or_else(|| "event".into());
        let event_type = lookup(":event-type")
            .or_else(|| lookup(":exception-type"))
            .or_else(|| lookup(":error-code"))
            .unwrap_or_default();

        Ok(Some(Frame {
            message_type,
            event_type,
            payload,
        }))
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// String-valued headers; other value types are skipped by width.
fn parse_headers(mut buf: &[u8]) -> Result<Vec<(String, String)>> {
    let malformed = || Error::Other("malformed event-stream header".into());
    let mut out = Vec::new();

    while !buf.is_empty() {
        let name_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return Err(malformed());
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        let value_type = buf[name_len];
        buf = &buf[name_len + 1..];

        let fixed = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | 7 => None,
            _ => return Err(malformed()),
        };

        match fixed {
            Some(width) => {
                if buf.len() < width {
                    return Err(malformed());
                }
                buf = &buf[width..];
            }
            None => {
                if buf.len() < 2 {
                    return Err(malformed());
                }
                let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                buf = &buf[2..];
                if buf.len() < len {
                    return Err(malformed());
                }
                if value_type == 7 {
                    out.push((name, String::from_utf8_lossy(&buf[..len]).into_owned()));
                }
                buf = &buf[len..];
            }
        }
    }
    Ok(out)
}

/// Encode a frame with string headers.
#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut hbuf = Vec::new();
    for (name, value) in headers {
        hbuf.push(name.len() as u8);
        hbuf.extend_from_slice(name.as_bytes());
        hbuf.push(7);
        hbuf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        hbuf.extend_from_slice(value.as_bytes());
    }
    let total = PRELUDE_LEN + hbuf.len() + payload.len() + TRAILER_LEN;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(hbuf.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&hbuf);
    frame.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}
