//! Record sink port for survey answers and chat transcripts.
//!
//! Appends are fire-and-forget from the core's perspective: callers log
//! failures and move on.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AnswerRecord, TranscriptEntry};

/// Errors that can occur while appending records.
#[derive(Debug, Error)]
pub enum RecordSinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Port for persisting answers and transcript entries.
#[async_trait]
pub trait SurveyRecordSink: Send + Sync {
    /// Append a `(nodeId, question, answer)` record.
    async fn append_answer(&self, record: AnswerRecord) -> Result<(), RecordSinkError>;

    /// Append a chat transcript entry.
    async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), RecordSinkError>;
}

/// A record sink that discards everything.
///
/// Suitable for tests and CLI runs without a records file.
#[derive(Debug, Clone, Default)]
pub struct NoopRecordSink;

impl NoopRecordSink {
    /// Create a new no-op sink.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SurveyRecordSink for NoopRecordSink {
    async fn append_answer(&self, _record: AnswerRecord) -> Result<(), RecordSinkError> {
        Ok(())
    }

    async fn append_transcript(&self, _entry: TranscriptEntry) -> Result<(), RecordSinkError> {
        Ok(())
    }
}
