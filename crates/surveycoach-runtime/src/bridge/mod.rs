//! Streaming bridge: wraps one `run_inference` call as a cancellable
//! [`Stream`] of [`StreamChunk`]s for a single consumer.
//!
//! All bridged requests in the process pass through one single-slot gate,
//! so at most one generation is in flight at a time even across handles.
//! Dropping an [`InferenceStream`] cancels its request; the request task
//! then settles the handle (cancel, wait, reset) before releasing the gate.

mod buffer;
mod request;
mod state;
mod watchdog;

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use surveycoach_core::{InferenceError, ModelInput};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

pub use state::{StreamPhase, StreamState};

use crate::handle::ModelHandle;
use crate::manager::{BusyPolicy, SessionManager};
use request::Request;

// ── Settings ───────────────────────────────────────────────────────────

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_millis(150);
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Timing and buffering knobs for bridged requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeSettings {
    /// How often the watchdog polls the handle.
    pub poll_interval: Duration,
    /// How long the handle must stay idle after the terminal partial.
    pub idle_grace: Duration,
    /// Upper bound on the post-terminal watchdog.
    pub watchdog_timeout: Duration,
    /// Upper bound on waiting for the handle after an interruption.
    pub settle_timeout: Duration,
    /// Per-request deadline; `None` disables it.
    pub request_timeout: Option<Duration>,
    /// Non-final chunks buffered before the oldest is dropped.
    pub buffer_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_grace: DEFAULT_IDLE_GRACE,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl BridgeSettings {
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ── Chunks ─────────────────────────────────────────────────────────────

/// One element of an [`InferenceStream`].
///
/// `text` is everything generated so far; `delta` is what this chunk
/// added. Under backpressure intermediate chunks may be dropped, so
/// consumers should render `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub delta: String,
    pub is_final: bool,
    pub error: Option<InferenceError>,
}

impl StreamChunk {
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Gate ───────────────────────────────────────────────────────────────

static GENERATION_GATE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// The process-wide single-slot gate shared by bridges that do not
/// supply their own.
pub fn generation_gate() -> Arc<Semaphore> {
    Arc::clone(GENERATION_GATE.get_or_init(|| Arc::new(Semaphore::new(1))))
}

// ── Bridge ─────────────────────────────────────────────────────────────

/// Turns `run_inference` callbacks into per-request streams.
#[derive(Clone)]
pub struct StreamingBridge {
    manager: Arc<SessionManager>,
    handle: Arc<ModelHandle>,
    gate: Arc<Semaphore>,
    settings: BridgeSettings,
}

impl StreamingBridge {
    pub fn new(manager: Arc<SessionManager>, handle: Arc<ModelHandle>) -> Self {
        Self {
            manager,
            handle,
            gate: generation_gate(),
            settings: BridgeSettings::default(),
        }
    }

    #[must_use]
    pub const fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a private gate instead of the process-wide one.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = gate;
        self
    }

    pub const fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub const fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    pub const fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Replace the handle's session with a fresh one.
    ///
    /// Holds the gate for the duration so no bridged request can claim
    /// the handle mid-reset, and waits up to the settle timeout for an
    /// interrupted generation to release it first. Returns `false` if the
    /// handle stayed busy or the reset backed off.
    pub async fn reset_session(&self) -> bool {
        let Ok(_permit) = self.gate.acquire().await else {
            warn!(handle = %self.handle.name(), "Generation gate closed");
            return false;
        };
        if !watchdog::wait_until_idle(&self.handle, &self.settings).await {
            debug!(handle = %self.handle.name(), "Reset skipped: handle still busy");
            return false;
        }
        watchdog::reset_session(&self.manager, &self.handle).await
    }

    /// Start a bridged request. Must be called inside a Tokio runtime.
    pub fn stream(&self, input: ModelInput, policy: BusyPolicy) -> InferenceStream {
        let (tx, rx) = mpsc::channel(self.settings.buffer_capacity.max(1));
        let cancel = CancellationToken::new();
        let state = Arc::new(StreamState::default());

        let request = Request {
            manager: Arc::clone(&self.manager),
            handle: Arc::clone(&self.handle),
            gate: Arc::clone(&self.gate),
            settings: self.settings,
            input,
            policy,
            tx,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        };
        tokio::spawn(request.run());

        InferenceStream {
            rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
            state,
        }
    }
}

impl std::fmt::Debug for StreamingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBridge")
            .field("handle", &self.handle.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Consumer side of a bridged request.
///
/// Yields partial chunks followed by exactly one final chunk, then ends.
/// Dropping the stream cancels the request.
pub struct InferenceStream {
    rx: mpsc::Receiver<StreamChunk>,
    cancel: CancellationToken,
    state: Arc<StreamState>,
    _guard: DropGuard,
}

impl InferenceStream {
    /// Cancel the request. The stream still yields a final `Cancelled`
    /// chunk if it is being polled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request; usable after the stream is moved.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared request state; outlives the stream.
    pub fn state(&self) -> Arc<StreamState> {
        Arc::clone(&self.state)
    }
}

impl Stream for InferenceStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for InferenceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceStream")
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}
