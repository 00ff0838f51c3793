//! Server-sent events from llama-server's `/completion` endpoint.
//!
//! Each event is a line `data: {"content":"...","stop":false,...}`; the
//! last one has `"stop": true`. Errors arrive as `data: {"error":{...}}`.

use serde::Deserialize;
use serde_json::Value;

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CompletionEvent {
    Content(String),
    Stop(String),
    Error(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    error: Option<Value>,
}

/// Decode one SSE line. Blank lines, comments and unknown fields yield
/// `None`.
pub(crate) fn parse_line(line: &str) -> Option<CompletionEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(CompletionEvent::Stop(String::new()));
    }

    let raw: RawEvent = serde_json::from_str(data).ok()?;
    if let Some(error) = raw.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Some(CompletionEvent::Error(message));
    }
    Some(if raw.stop {
        CompletionEvent::Stop(raw.content)
    } else {
        CompletionEvent::Content(raw.content)
    })
}

/// Reassembles lines from arbitrarily split network chunks.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string())
    }
}
