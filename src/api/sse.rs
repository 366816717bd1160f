//! Incremental decoder for the streamed QA answer.
//!
//! The service speaks a loose SSE dialect: frames separated by a blank line,
//! payload on `data:` lines, `[DONE]` as the end sentinel. The JSON inside a
//! frame comes in several shapes depending on the workflow that produced it.

use super::wire::parse_citations;
use super::{ApiResult, ByteStream};
use crate::types::Citation;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

const DONE_SENTINEL: &str = "[DONE]";
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Raw answer text, possibly containing inline reasoning markers.
    Content(String),
    /// Reasoning delivered out of band.
    Thinking(String),
    Citations(Vec<Citation>),
    Done,
    /// The service reported a failure inside the stream.
    Failed(String),
}

/// Splits a byte stream into frame payloads.
///
/// Bytes are buffered until a full frame is available, so a frame (or a
/// multi-byte character) split across network reads is reassembled before
/// it is decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network read and returns the `data` payload of every frame
    /// it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(data) = frame_data(&frame[..pos]) {
                frames.push(data);
            }
        }
        frames
    }

    /// Flushes a trailing frame the server closed without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        frame_data(&rest)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn frame_data(frame: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(frame);
    let lines: Vec<&str> = text
        .split('\n')
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Interprets one frame payload. Malformed JSON is logged and skipped.
pub fn parse_frame_data(data: &str) -> Option<StreamEvent> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, frame = %truncate(trimmed, 120), "skipping malformed stream frame");
            return None;
        }
    };
    parse_payload(&value)
}

fn parse_payload(value: &Value) -> Option<StreamEvent> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Some(StreamEvent::Failed(message.to_string()));
    }

    if let Some(first) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        let piece = first
            .pointer("/delta/content")
            .or_else(|| first.pointer("/message/content"))
            .and_then(Value::as_str);
        if let Some(piece) = piece {
            return Some(StreamEvent::Content(piece.to_string()));
        }
        return first
            .pointer("/delta/reasoning_content")
            .and_then(Value::as_str)
            .map(|piece| StreamEvent::Thinking(piece.to_string()));
    }

    if let Some(data) = value.get("data").filter(|data| data.is_object()) {
        if let Some(event) = citations_event(data) {
            return Some(event);
        }
        return data
            .get("chunk")
            .and_then(Value::as_str)
            .map(|chunk| StreamEvent::Content(chunk.to_string()));
    }

    if let Some(event) = citations_event(value) {
        return Some(event);
    }

    let content = value.get("content").and_then(Value::as_str)?;
    if value.get("type").and_then(Value::as_str) == Some("thinking") {
        Some(StreamEvent::Thinking(content.to_string()))
    } else {
        Some(StreamEvent::Content(content.to_string()))
    }
}

fn citations_event(value: &Value) -> Option<StreamEvent> {
    if value.get("type").and_then(Value::as_str) != Some("citations") {
        return None;
    }
    let citations = value
        .get("citations")
        .cloned()
        .map(parse_citations)
        .unwrap_or_default();
    Some(StreamEvent::Citations(citations))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Decodes a response body into events. The stream ends after `Done`, after
/// the first transport error, or when the body ends.
pub fn decode_events(mut body: ByteStream) -> BoxStream<'static, ApiResult<StreamEvent>> {
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for data in decoder.push(&bytes) {
                if let Some(event) = parse_frame_data(&data) {
                    let done = event == StreamEvent::Done;
                    yield Ok(event);
                    if done {
                        return;
                    }
                }
            }
        }
        if let Some(event) = decoder.finish().as_deref().and_then(parse_frame_data) {
            yield Ok(event);
        }
    })
}

// ============================================
// Reasoning extraction
// ============================================

/// Splits the cumulative raw answer into visible content and reasoning.
///
/// Runs over the whole buffer each time so a marker pair split across
/// chunks is still recognised. While `finished` is false, trailing
/// whitespace and a trailing partial `<think>` are held back; that keeps the
/// visible text a growing prefix of its final value.
pub fn split_reasoning(raw: &str, finished: bool) -> (String, String) {
    let mut visible = String::new();
    let mut segments: Vec<&str> = Vec::new();
    let mut rest = raw;

    loop {
        let Some(start) = rest.find(THINK_OPEN) else {
            visible.push_str(rest);
            break;
        };
        visible.push_str(rest[..start].trim_end());
        let inner = &rest[start + THINK_OPEN.len()..];
        match inner.find(THINK_CLOSE) {
            Some(end) => {
                segments.push(inner[..end].trim());
                rest = inner[end + THINK_CLOSE.len()..].trim_start();
            }
            None => {
                let open = if finished {
                    inner
                } else {
                    strip_partial_suffix(inner, THINK_CLOSE)
                };
                segments.push(open.trim());
                break;
            }
        }
    }

    if !finished {
        let held = strip_partial_suffix(&visible, THINK_OPEN).trim_end().len();
        visible.truncate(held);
    }

    let thinking = segments
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (visible, thinking)
}

/// Drops the longest suffix of `text` that is a proper prefix of `marker`.
fn strip_partial_suffix<'a>(text: &'a str, marker: &str) -> &'a str {
    for len in (1..marker.len()).rev() {
        if text.ends_with(&marker[..len]) {
            return &text[..text.len() - len];
        }
    }
    text
}
