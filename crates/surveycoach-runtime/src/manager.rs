//! Session manager: owns engine/session lifecycle and enforces single-flight
//! generation per [`ModelHandle`].
//!
//! All operations are synchronous and may block on native calls; async
//! callers should run them on a blocking thread. No operation holds the
//! handle's pair lock while an engine or session is being closed.
//!
//! Callbacks from the native engine are tagged with the generation token
//! captured at run start. Events whose token no longer matches the handle's
//! current token are dropped, so a cancelled generation can never reach a
//! newer request's consumer.

use std::sync::{Arc, Weak};

use surveycoach_core::{
    Backend, EngineError, EngineFactory, EngineSpec, InferenceConfig, InferenceEngine,
    InferenceError, InferenceSession, ModelInput, NativeCallback, NativeEvent,
    normalize_error_message,
};
use tracing::{debug, info, trace, warn};

use crate::handle::{CleanupListener, ModelHandle, RunState};

/// What `run_inference` does when the handle is already generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Fail the new request with [`InferenceError::Busy`].
    #[default]
    Reject,
    /// Cancel the running generation, then start the new one.
    CancelAndStart,
}

/// One progress delivery to a `run_inference` caller.
///
/// `text` is the newly generated delta; on a failed terminal it carries the
/// normalized error message and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partial {
    pub text: String,
    pub done: bool,
    pub error: Option<InferenceError>,
}

impl Partial {
    fn delta(text: String) -> Self {
        Self {
            text,
            done: false,
            error: None,
        }
    }

    fn finished(text: String) -> Self {
        Self {
            text,
            done: true,
            error: None,
        }
    }

    fn failed(error: InferenceError) -> Self {
        Self {
            text: error.user_message(),
            done: true,
            error: Some(error),
        }
    }
}

/// Receives progress for one `run_inference` call.
pub type PartialListener = Arc<dyn Fn(Partial) + Send + Sync>;

/// Builds, resets, runs, cancels and destroys engine/session pairs.
pub struct SessionManager {
    factory: Arc<dyn EngineFactory>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self { factory }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Build a fresh engine/session pair for `handle`, replacing any
    /// existing one.
    ///
    /// Tries the preferred backend first and the fallback backend once if
    /// that fails. Returns the backend the engine was built on.
    pub fn initialize(
        &self,
        handle: &ModelHandle,
        config: InferenceConfig,
    ) -> Result<Backend, InferenceError> {
        let previous = handle
            .detach_for_initialize()
            .map_err(|()| InferenceError::Busy)?;
        if let Some(pair) = previous {
            debug!(handle = %handle.name(), "Replacing existing resource pair");
            pair.destroy(handle.name());
        }

        handle.set_config(config.clone());

        let (engine, backend) = self.construct_engine(handle.name(), &config)?;
        let params = config.sampling().sanitized();
        let session = match engine.create_session(&params) {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = engine.close() {
                    warn!(handle = %handle.name(), error = %close_err, "Engine close after failed session build");
                }
                return Err(construction_failed(&e));
            }
        };

        if let Some(displaced) = handle.publish(engine, session) {
            // A concurrent initialize published first; ours wins.
            displaced.destroy(handle.name());
        }

        info!(
            handle = %handle.name(),
            backend = %backend,
            max_tokens = params.max_tokens,
            "Model initialized"
        );
        Ok(backend)
    }

    fn construct_engine(
        &self,
        handle_name: &str,
        config: &InferenceConfig,
    ) -> Result<(Arc<dyn InferenceEngine>, Backend), InferenceError> {
        let preferred = config.preferred_backend();
        let mut spec = EngineSpec {
            model_path: config.model_path.clone(),
            backend: preferred,
            max_tokens: config.sampling().sanitized().max_tokens,
        };

        match self.factory.create_engine(&spec) {
            Ok(engine) => Ok((engine, preferred)),
            Err(first) if config.fallback_backend != preferred => {
                warn!(
                    handle = %handle_name,
                    backend = %preferred,
                    fallback = %config.fallback_backend,
                    error = %first,
                    "Preferred backend failed, trying fallback"
                );
                spec.backend = config.fallback_backend;
                self.factory
                    .create_engine(&spec)
                    .map(|engine| (engine, spec.backend))
                    .map_err(|e| construction_failed(&e))
            }
            Err(e) => Err(construction_failed(&e)),
        }
    }

    /// Replace the session with a fresh one bound to the same engine.
    ///
    /// Returns `false` without side effects if the handle is uninitialized,
    /// busy, or the engine changed while the new session was being built.
    /// A generation claimed while the session is being built wins and the
    /// reset backs off.
    pub fn reset_session(&self, handle: &ModelHandle) -> bool {
        if handle.is_busy() {
            debug!(handle = %handle.name(), "Reset skipped: handle busy");
            return false;
        }
        let swapped = self.rebuild_session(handle, RunState::Idle);
        if swapped {
            debug!(handle = %handle.name(), "Session reset");
        }
        swapped
    }

    /// Build a session off-lock and swap it in if the pair and run state
    /// are unchanged. The displaced session is closed off-lock.
    fn rebuild_session(&self, handle: &ModelHandle, required: RunState) -> bool {
        let Some(snapshot) = handle.engine_snapshot() else {
            return false;
        };
        let params = handle.config().sampling().sanitized();
        let fresh = match snapshot.engine.create_session(&params) {
            Ok(session) => session,
            Err(e) => {
                warn!(handle = %handle.name(), error = %e, "Session rebuild failed");
                return false;
            }
        };

        match handle.swap_session(snapshot.id, required, fresh) {
            Ok(old) => {
                close_session(handle.name(), old.as_ref());
                true
            }
            Err(fresh) => {
                debug!(handle = %handle.name(), "Engine changed during session rebuild");
                close_session(handle.name(), fresh.as_ref());
                false
            }
        }
    }

    /// Tear down the handle's pair.
    ///
    /// When idle the pair is destroyed immediately. When a generation is in
    /// flight, cleanup is marked pending and the generation is cancelled;
    /// destruction happens when a terminal event is next observed. `on_done`
    /// is invoked before returning in both cases.
    pub fn cleanup(&self, handle: &ModelHandle, on_done: impl FnOnce()) {
        match handle.detach_if_idle() {
            Ok(pair) => {
                handle.take_cleanup_pending();
                if let Some(pair) = pair {
                    pair.destroy(handle.name());
                    info!(handle = %handle.name(), "Model released");
                }
            }
            Err(()) => {
                info!(handle = %handle.name(), "Generation in flight, deferring cleanup");
                handle.mark_cleanup_pending();
                self.cancel(handle);
            }
        }
        on_done();
    }

    // ── Generation ─────────────────────────────────────────────────────

    /// Start a generation on `handle`.
    ///
    /// Returns once the generation is underway (or has been rejected).
    /// `on_partial` receives every delta and exactly one terminal
    /// [`Partial`]; rejected requests receive only the terminal one.
    /// `on_clean` is invoked at most once, when this generation ends or is
    /// cancelled, and never for a request that was rejected before it
    /// claimed the handle.
    ///
    /// A handle whose teardown is still pending is reported as not
    /// initialized; the pair is destroyed only once the cancelled
    /// generation's terminal event arrives, or by the next `initialize`.
    pub fn run_inference(
        &self,
        handle: &Arc<ModelHandle>,
        input: ModelInput,
        policy: BusyPolicy,
        on_partial: PartialListener,
        on_clean: CleanupListener,
    ) {
        if handle.cleanup_pending() || !handle.is_initialized() {
            on_partial(Partial::failed(InferenceError::NotInitialized));
            return;
        }
        if input.is_empty() {
            on_partial(Partial::failed(InferenceError::EmptyInput));
            return;
        }

        let claimed = handle.claim_generation().or_else(|| {
            (policy == BusyPolicy::CancelAndStart).then(|| {
                debug!(handle = %handle.name(), "Cancelling running generation for new request");
                self.cancel(handle);
                handle.claim_generation()
            })?
        });
        let Some(token) = claimed else {
            on_partial(Partial::failed(InferenceError::Busy));
            return;
        };
        handle.register_cleanup(token, on_clean);

        let Some(snapshot) = handle.session_snapshot() else {
            // Pair detached between the check and the claim.
            abort_start(handle, token, &on_partial, InferenceError::NotInitialized);
            return;
        };

        let session = match snapshot.session.add_input(&input) {
            Ok(()) => snapshot.session,
            Err(first) => {
                warn!(handle = %handle.name(), error = %first, "add_input failed, rebuilding session");
                match self.retry_input(handle, snapshot.id, &input) {
                    Ok(session) => session,
                    Err(e) => {
                        abort_start(handle, token, &on_partial, streaming_failed(&e));
                        return;
                    }
                }
            }
        };

        let callback = generation_callback(Arc::downgrade(handle), token, on_partial.clone());
        debug!(handle = %handle.name(), token, "Starting generation");
        if let Err(e) = session.generate_async(callback) {
            abort_start(handle, token, &on_partial, streaming_failed(&e));
        }
    }

    /// Rebuild the session once and re-feed the input.
    fn retry_input(
        &self,
        handle: &ModelHandle,
        pair_id: u64,
        input: &ModelInput,
    ) -> Result<Arc<dyn InferenceSession>, EngineError> {
        if !self.rebuild_session(handle, RunState::Running) {
            return Err(EngineError::SessionFailed(
                "session rebuild after input failure".to_string(),
            ));
        }
        let snapshot = handle
            .session_snapshot()
            .filter(|s| s.id == pair_id)
            .ok_or_else(|| EngineError::SessionFailed("engine replaced during retry".to_string()))?;
        snapshot.session.add_input(input)?;
        Ok(snapshot.session)
    }

    /// Cancel the running generation, if any.
    ///
    /// Advances the generation token (so late native callbacks are
    /// ignored), requests native cancellation, sets the handle idle and
    /// invokes the cancelled generation's cleanup listener. No-op when the
    /// handle is idle.
    pub fn cancel(&self, handle: &ModelHandle) {
        if !handle.begin_cancel() {
            return;
        }
        let stale = handle.advance_generation() - 1;
        if let Some(snapshot) = handle.session_snapshot() {
            snapshot.session.cancel();
        }
        handle.set_idle();
        debug!(handle = %handle.name(), token = stale, "Generation cancelled");
        if let Some(listener) = handle.take_cleanup(stale) {
            listener();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

// ── Callback plumbing ──────────────────────────────────────────────────

/// Wrap a partial listener in a native callback bound to `token`.
///
/// Holds the handle weakly: the session stores the callback and the handle
/// owns the session.
fn generation_callback(
    handle: Weak<ModelHandle>,
    token: u64,
    listener: PartialListener,
) -> NativeCallback {
    Arc::new(move |event: NativeEvent| {
        let Some(handle) = handle.upgrade() else {
            return;
        };

        if handle.generation() != token {
            trace!(handle = %handle.name(), token, "Dropping stale callback");
            if event.is_terminal() && handle.is_idle() {
                run_deferred_cleanup(&handle);
            }
            return;
        }

        match event {
            NativeEvent::Partial(text) => listener(Partial::delta(text)),
            NativeEvent::Done(text) => finish_generation(&handle, token, &listener, Partial::finished(text)),
            NativeEvent::Failed(message) => {
                let error = InferenceError::StreamingFailed(normalize_error_message(&message));
                finish_generation(&handle, token, &listener, Partial::failed(error));
            }
        }
    })
}

/// Terminal path shared by natural completion and start failures.
///
/// A start failure counts as the generation's terminal event, so its
/// cleanup listener fires here too.
///
/// Order: detach a pending-cleanup pair while still running, set idle,
/// forward the terminal, fire the cleanup listener, then destroy the
/// detached pair.
fn finish_generation(
    handle: &ModelHandle,
    token: u64,
    listener: &PartialListener,
    terminal: Partial,
) {
    let deferred = if handle.take_cleanup_pending() {
        handle.detach()
    } else {
        None
    };

    if !handle.finish_running() {
        // A cancel won the race; it owns the listener.
        trace!(handle = %handle.name(), token, "Terminal after cancel ignored");
        if let Some(pair) = deferred {
            pair.destroy(handle.name());
        }
        return;
    }

    listener(terminal);
    if let Some(cleanup) = handle.take_cleanup(token) {
        cleanup();
    }
    if let Some(pair) = deferred {
        info!(handle = %handle.name(), "Deferred cleanup complete");
        pair.destroy(handle.name());
    }
}

/// Perform a pending teardown once the native side has gone quiet.
fn run_deferred_cleanup(handle: &ModelHandle) {
    if !handle.cleanup_pending() {
        return;
    }
    if let Ok(pair) = handle.detach_if_idle() {
        handle.take_cleanup_pending();
        if let Some(pair) = pair {
            pair.destroy(handle.name());
            info!(handle = %handle.name(), "Deferred cleanup complete");
        }
    }
}

fn abort_start(
    handle: &ModelHandle,
    token: u64,
    listener: &PartialListener,
    error: InferenceError,
) {
    warn!(handle = %handle.name(), token, error = %error, "Generation failed to start");
    finish_generation(handle, token, listener, Partial::failed(error));
}

fn close_session(handle_name: &str, session: &dyn InferenceSession) {
    if let Err(e) = session.close() {
        warn!(handle = %handle_name, error = %e, "Session close failed");
    }
}

fn construction_failed(error: &EngineError) -> InferenceError {
    InferenceError::ConstructionFailed(normalize_error_message(&error.to_string()))
}

fn streaming_failed(error: &EngineError) -> InferenceError {
    InferenceError::StreamingFailed(normalize_error_message(&error.to_string()))
}
