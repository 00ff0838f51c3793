//! Core domain types, configuration and port definitions for surveycoach.
//!
//! This crate has no runtime or adapter dependencies. It defines:
//! - the inference error taxonomy delivered to callers ([`InferenceError`])
//! - configuration consumed by `initialize` ([`InferenceConfig`], [`SamplingParams`])
//! - the engine/session port implemented by native backends ([`ports::engine`])
//! - the extractor and record-sink collaborators ([`ports::extractor`], [`ports::records`])
#![deny(unused_crate_dependencies)]

pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod ports;
pub mod prompt;
pub mod sampling;

// Re-export commonly used types for convenience
pub use config::{Backend, ConfigError, InferenceConfig, validate_config};
pub use domain::{
    AnswerRecord, AnswerSubmission, AudioPayload, Evaluation, ModelInput, TranscriptEntry,
    TranscriptRole,
};
pub use error::{InferenceError, normalize_error_message};
pub use extract::JsonFollowupExtractor;
pub use ports::{
    EngineError, EngineFactory, EngineSpec, FollowupExtractor, InferenceEngine, InferenceSession,
    NativeCallback, NativeEvent, NoopRecordSink, RecordSinkError, SurveyRecordSink,
};
pub use prompt::PromptFraming;
pub use sampling::SamplingParams;
