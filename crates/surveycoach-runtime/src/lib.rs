//! Runtime for surveycoach: session lifecycle, streaming and engine adapters.
//!
//! - [`ModelHandle`] binds a configuration to at most one engine/session pair
//! - [`SessionManager`] builds, resets, runs, cancels and tears down pairs
//! - [`StreamingBridge`] turns one generation into a cancellable stream
//! - [`AnswerEvaluator`] is the survey-facing surface on top of the bridge
//! - [`llama`] launches llama-server as an engine backend
#![deny(unused_crate_dependencies)]

// The package lists itself as a dev-dependency (to enable `test-utils` for
// integration tests); the lib's own unit-test build doesn't use it.
#[cfg(test)]
use surveycoach_runtime as _;

pub mod bridge;
pub mod evaluator;
pub mod handle;
pub mod llama;
pub mod manager;
pub mod records;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bridge::{
    BridgeSettings, InferenceStream, StreamChunk, StreamPhase, StreamState, StreamingBridge,
    generation_gate,
};
pub use evaluator::{AnswerEvaluator, EvaluationUpdate};
pub use handle::{CleanupListener, ModelHandle, RunState};
pub use llama::{LlamaServerFactory, LlamaServerSettings};
pub use manager::{BusyPolicy, Partial, PartialListener, SessionManager};
pub use records::JsonlRecordSink;
