//! Survey answer submissions and the records persisted for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One answer the user submitted for evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    /// Survey graph node the question belongs to.
    pub node_id: String,
    /// Question text shown to the user.
    pub question: String,
    /// The user's answer.
    pub answer: String,
}

impl AnswerSubmission {
    pub fn new(
        node_id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Persisted `(nodeId, question, answer)` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub node_id: String,
    pub question: String,
    pub answer: String,
    pub recorded_at: DateTime<Utc>,
}

impl AnswerRecord {
    /// Record a submission at the current time.
    pub fn from_submission(submission: &AnswerSubmission) -> Self {
        Self {
            node_id: submission.node_id.clone(),
            question: submission.question.clone(),
            answer: submission.answer.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Speaker of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// One entry in the chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub node_id: String,
    pub role: TranscriptRole,
    pub text: String,
    /// Error annotation when the response ended early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn user(node_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role: TranscriptRole::User,
            text: text.into(),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn assistant(node_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role: TranscriptRole::Assistant,
            text: text.into(),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// Annotate the entry with an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of evaluating one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Full model response.
    pub text: String,
    /// Score extracted from the response, if any.
    pub score: Option<i32>,
    /// Follow-up questions extracted from the response.
    pub followups: Vec<String>,
}
