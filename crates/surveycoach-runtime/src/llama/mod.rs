//! Engine adapter backed by a local llama-server process.
//!
//! Each engine owns one llama-server child bound to a free loopback port.
//! Sessions are prompt transcripts trimmed to fit the context window;
//! generation posts the transcript to
//! `/completion` with `stream: true` and pushes parsed SSE events into the
//! session callback from a task on the supplied runtime.
//!
//! Engine construction blocks on the runtime, so the factory must be
//! called from a blocking thread (as the session manager's callers do).

mod engine;
mod error;
mod health;
mod process;
mod sse;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use surveycoach_core::{EngineError, EngineFactory, EngineSpec, InferenceEngine};
use tokio::runtime::Handle;
use tracing::info;

pub use engine::{LlamaServerEngine, LlamaServerSession};
pub use error::LlamaServerError;
pub use health::check_http_health;

/// Default time allowed for the model to load.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default context window, in tokens.
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// How llama-server is launched.
#[derive(Debug, Clone)]
pub struct LlamaServerSettings {
    /// Path to the `llama-server` binary.
    pub server_path: PathBuf,
    /// How long to wait for `/health` after spawning.
    pub startup_timeout: Duration,
    /// Context window passed as `-c`. Never below the generation cap.
    pub context_size: u32,
    /// Extra arguments appended to the command line.
    pub extra_args: Vec<String>,
}

impl LlamaServerSettings {
    pub fn new(server_path: impl Into<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            context_size: DEFAULT_CONTEXT_SIZE,
            extra_args: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_context_size(mut self, tokens: u32) -> Self {
        self.context_size = tokens;
        self
    }

    /// Context window for an engine generating up to `max_tokens`.
    pub fn effective_context(&self, max_tokens: u32) -> u32 {
        self.context_size.max(max_tokens)
    }
}

/// Builds [`LlamaServerEngine`]s.
pub struct LlamaServerFactory {
    settings: LlamaServerSettings,
    runtime: Handle,
    client: reqwest::Client,
}

impl LlamaServerFactory {
    pub fn new(settings: LlamaServerSettings, runtime: Handle) -> Result<Self, LlamaServerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            settings,
            runtime,
            client,
        })
    }

    async fn launch(&self, spec: &EngineSpec) -> Result<LlamaServerEngine, LlamaServerError> {
        let port = process::free_port()?;
        let base_url = format!("http://127.0.0.1:{port}");
        let mut child = process::spawn_server(&self.settings, spec, port)?;

        tokio::select! {
            ready = health::wait_for_http_health(&self.client, &base_url, port, self.settings.startup_timeout) => ready?,
            status = child.wait() => {
                return Err(LlamaServerError::ExitedEarly {
                    status: status.map_or_else(|e| e.to_string(), |s| s.to_string()),
                });
            }
        }

        let context_size = self.settings.effective_context(spec.max_tokens);
        info!(
            port,
            backend = %spec.backend,
            model = %spec.model_path.display(),
            context_size,
            "llama-server started"
        );
        Ok(LlamaServerEngine::new(
            spec.backend,
            base_url,
            child,
            context_size,
            self.client.clone(),
            self.runtime.clone(),
        ))
    }
}

impl EngineFactory for LlamaServerFactory {
    fn create_engine(&self, spec: &EngineSpec) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        self.runtime
            .block_on(self.launch(spec))
            .map(|engine| Arc::new(engine) as Arc<dyn InferenceEngine>)
            .map_err(|e| e.into_engine_error(spec.backend))
    }
}

impl std::fmt::Debug for LlamaServerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaServerFactory")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
