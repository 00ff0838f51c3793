//! Inference error taxonomy.
//!
//! Every failure the session manager reports is one of these variants.
//! Nothing here is fatal to the process: construction and busy errors are
//! returned to the caller, streaming failures travel as a terminal stream
//! element with the error attached.

use thiserror::Error;

/// Maximum length of a normalized error message.
const MAX_MESSAGE_LEN: usize = 160;

/// Errors reported by the session manager and streaming bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// No engine/session pair has been built yet.
    #[error("model not initialized")]
    NotInitialized,

    /// Another generation owns the handle.
    #[error("busy: another generation is in progress")]
    Busy,

    /// Engine or session construction failed (after any backend fallback).
    #[error("engine construction failed: {0}")]
    ConstructionFailed(String),

    /// The request carried neither text nor audio.
    #[error("input is empty")]
    EmptyInput,

    /// The request exceeded its deadline and was cancelled.
    #[error("generation timed out")]
    Timeout,

    /// The consumer cancelled the request.
    #[error("generation cancelled")]
    Cancelled,

    /// The native engine failed while generating.
    #[error("streaming failed: {0}")]
    StreamingFailed(String),
}

impl InferenceError {
    /// Short human-readable message for UI annotation.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// `Timeout` and `Cancelled` drive the same cancel-then-settle path.
    #[must_use]
    pub const fn is_interruption(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }

    /// Stable label for logs and transcripts.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Busy => "busy",
            Self::ConstructionFailed(_) => "construction_failed",
            Self::EmptyInput => "empty_input",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::StreamingFailed(_) => "streaming_failed",
        }
    }
}

/// Normalize a native error message into a short single-line string.
///
/// Keeps the first non-empty line, strips a leading `Error:` prefix and caps
/// the result at [`MAX_MESSAGE_LEN`] characters.
pub fn normalize_error_message(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown error");

    let line = line
        .strip_prefix("Error:")
        .or_else(|| line.strip_prefix("error:"))
        .map_or(line, str::trim_start);

    if line.chars().count() <= MAX_MESSAGE_LEN {
        return line.to_string();
    }

    let mut short: String = line.chars().take(MAX_MESSAGE_LEN - 1).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_message_mentions_busy() {
        assert!(InferenceError::Busy.user_message().starts_with("busy"));
    }

    #[test]
    fn not_initialized_message() {
        assert!(
            InferenceError::NotInitialized
                .user_message()
                .contains("not initialized")
        );
    }

    #[test]
    fn interruptions_are_timeout_and_cancel() {
        assert!(InferenceError::Timeout.is_interruption());
        assert!(InferenceError::Cancelled.is_interruption());
        assert!(!InferenceError::Busy.is_interruption());
        assert!(!InferenceError::StreamingFailed("x".into()).is_interruption());
    }

    #[test]
    fn normalize_keeps_first_line() {
        let raw = "\n  Error: failed to open model file\n  at native frame 0x1234\n";
        assert_eq!(normalize_error_message(raw), "failed to open model file");
    }

    #[test]
    fn normalize_empty_input() {
        assert_eq!(normalize_error_message("   \n"), "unknown error");
    }

    #[test]
    fn normalize_caps_length() {
        let raw = "x".repeat(500);
        let normalized = normalize_error_message(&raw);
        assert_eq!(normalized.chars().count(), MAX_MESSAGE_LEN);
        assert!(normalized.ends_with('…'));
    }
}
