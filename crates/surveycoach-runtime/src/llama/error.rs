//! Errors raised while launching and talking to llama-server.

use std::path::PathBuf;

use surveycoach_core::{Backend, EngineError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlamaServerError {
    #[error("llama-server binary not found at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to spawn llama-server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no free local port: {0}")]
    Port(#[source] std::io::Error),

    #[error("llama-server exited during startup ({status})")]
    ExitedEarly { status: String },

    #[error("llama-server not ready on port {port} after {waited_secs}s")]
    StartupTimeout { port: u16, waited_secs: u64 },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlamaServerError {
    /// Map into the engine port's error, attributing startup failures to
    /// the backend being constructed so the manager can fall back.
    pub fn into_engine_error(self, backend: Backend) -> EngineError {
        match self {
            Self::ExitedEarly { .. } | Self::StartupTimeout { .. } => {
                EngineError::BackendUnavailable {
                    backend,
                    reason: self.to_string(),
                }
            }
            Self::NotFound { .. } | Self::Spawn(_) | Self::Port(_) | Self::Http(_) => {
                EngineError::LoadFailed(self.to_string())
            }
        }
    }
}
