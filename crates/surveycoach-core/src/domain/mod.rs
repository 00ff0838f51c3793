//! Domain types for model input and survey records.
//!
//! These are pure data types with no infrastructure dependencies.

pub mod input;
pub mod survey;

pub use input::{AudioPayload, ModelInput};
pub use survey::{
    AnswerRecord, AnswerSubmission, Evaluation, TranscriptEntry, TranscriptRole,
};
