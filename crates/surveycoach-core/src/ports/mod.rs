//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces the core expects from infrastructure.
//! They contain no implementation details and use only domain types.
//!
//! # Design Rules
//!
//! - Engine and session handles are opaque; only identity and lifecycle leak
//! - Native callbacks are push-style and may arrive on any thread
//! - Collaborators (extractor, record sink) never fail the caller

pub mod engine;
pub mod extractor;
pub mod records;

pub use engine::{
    EngineError, EngineFactory, EngineSpec, InferenceEngine, InferenceSession, NativeCallback,
    NativeEvent,
};
pub use extractor::FollowupExtractor;
pub use records::{NoopRecordSink, RecordSinkError, SurveyRecordSink};
