//! Shared NDJSON streaming infrastructure for line-delimited-JSON backends
//! (Ollama's `/api/chat` and `/api/generate` in streaming mode).
//!
//! Unlike SSE, there is no `data:`/`\n\n` framing — every line of the
//! response body is itself a complete JSON object. This mirrors `sse.rs`'s
//! shape but drains on a bare `\n` instead.

use crate::util::from_reqwest;
use jarvis_domain::error::Result;
use jarvis_domain::stream::{BoxStream, StreamEvent};

/// Extract complete lines from an NDJSON buffer.
///
/// The buffer is drained in-place: consumed bytes are removed and any
/// trailing partial line remains for the next call.
pub(crate) fn drain_json_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    lines
}

/// Build a [`BoxStream`] from an NDJSON `reqwest::Response` and a
/// provider-specific parser closure, one JSON object per line.
///
/// The stream automatically:
/// 1. Buffers incoming chunks and drains complete lines
/// 2. Flushes the remaining buffer when the response body closes
/// 3. Emits a fallback `Done` event if the parser never produced one
pub(crate) fn ndjson_response_stream<F>(
    response: reqwest::Response,
    mut parse_line: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for line in drain_json_lines(&mut buffer) {
                        for event in parse_line(&line) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push('\n');
                        for line in drain_json_lines(&mut buffer) {
                            for event in parse_line(&line) {
                                if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_line() {
        let mut buf = String::from("{\"a\":1}\n");
        let lines = drain_json_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_multiple_lines() {
        let mut buf = String::from("{\"a\":1}\n{\"a\":2}\n");
        let lines = drain_json_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn drain_partial_line_stays_in_buffer() {
        let mut buf = String::from("{\"a\":1}\n{\"a\":2");
        let lines = drain_json_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert_eq!(buf, "{\"a\":2");
    }

    #[test]
    fn drain_skips_blank_lines() {
        let mut buf = String::from("\n{\"a\":1}\n\n");
        let lines = drain_json_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn drain_empty_buffer() {
        let mut buf = String::new();
        assert!(drain_json_lines(&mut buf).is_empty());
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("{\"a\":1");
        assert!(drain_json_lines(&mut buf).is_empty());
        buf.push_str("}\n{\"a\":2}\n");
        let lines = drain_json_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"a\":2}"]);
    }
}
