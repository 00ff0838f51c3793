//! Engine and session port.
//!
//! An engine holds model weights and is expensive to build; a session is
//! bound to one engine and holds sampling parameters. Both are opaque to
//! the session manager, which only constructs, feeds, cancels and closes
//! them.
//!
//! Generation is push-style: [`InferenceSession::generate_async`] returns
//! as soon as generation has started and reports progress through a
//! [`NativeCallback`] invoked from an engine-owned thread.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Backend;
use crate::domain::ModelInput;
use crate::sampling::SamplingParams;

/// Errors raised by native engines and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("session creation failed: {0}")]
    SessionFailed(String),

    #[error("input rejected: {0}")]
    InputRejected(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("close failed: {0}")]
    CloseFailed(String),
}

/// One callback delivery from a running generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// A chunk of newly generated text.
    Partial(String),

    /// The final chunk (possibly empty); generation is over.
    Done(String),

    /// Generation failed; no further events follow.
    Failed(String),
}

impl NativeEvent {
    /// Whether this event ends the generation.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// Push-style progress callback. May be invoked from any thread.
pub type NativeCallback = Arc<dyn Fn(NativeEvent) + Send + Sync>;

/// What to construct an engine from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    /// Path to the model weights.
    pub model_path: PathBuf,
    /// Backend to construct on.
    pub backend: Backend,
    /// Maximum tokens (prompt + response) the engine must accommodate.
    pub max_tokens: u32,
}

/// Builds engines. Construction is slow and blocking.
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, spec: &EngineSpec) -> Result<Arc<dyn InferenceEngine>, EngineError>;
}

/// Heavy handle owning model weights.
pub trait InferenceEngine: Send + Sync {
    /// Backend the engine was constructed on.
    fn backend(&self) -> Backend;

    /// Build a new session bound to this engine.
    fn create_session(
        &self,
        params: &SamplingParams,
    ) -> Result<Arc<dyn InferenceSession>, EngineError>;

    /// Release the weights. Never called while a session is generating.
    fn close(&self) -> Result<(), EngineError>;
}

/// Lightweight generation context bound to one engine.
pub trait InferenceSession: Send + Sync {
    /// Queue input for the next generation.
    fn add_input(&self, input: &ModelInput) -> Result<(), EngineError>;

    /// Start generating. Returns once generation is underway.
    fn generate_async(&self, callback: NativeCallback) -> Result<(), EngineError>;

    /// Request cancellation of the running generation.
    ///
    /// Cooperative: the engine may still deliver callbacks afterwards, and
    /// may never deliver a terminal one.
    fn cancel(&self);

    /// Release the session. Never called while generating.
    fn close(&self) -> Result<(), EngineError>;
}
