//! Scripted in-process engine for tests and demos.
//!
//! [`ScriptedEngineFactory`] builds engines whose sessions replay a
//! [`GenerationScript`] from a background thread, the same way a native
//! engine pushes callbacks from its own thread. Every interesting call is
//! counted in [`EngineStats`] so tests can assert lifecycle invariants.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use surveycoach_core::{
    Backend, EngineError, EngineFactory, EngineSpec, InferenceEngine, InferenceSession,
    ModelInput, NativeCallback, NativeEvent, SamplingParams,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a scripted generation ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnding {
    /// Deliver `Done(final_text)`.
    Done,
    /// Deliver `Failed(message)`.
    Fail(String),
    /// Emit the chunks, then never deliver a terminal event.
    Silent,
    /// Emit nothing; the test drives the captured callback by hand.
    Manual,
}

/// What a scripted session emits for each generation.
#[derive(Debug, Clone)]
pub struct GenerationScript {
    pub chunks: Vec<String>,
    pub final_text: String,
    pub chunk_delay: Duration,
    pub ending: ScriptEnding,
}

impl Default for GenerationScript {
    fn default() -> Self {
        Self {
            chunks: vec!["Good ".to_string(), "answer.".to_string()],
            final_text: String::new(),
            chunk_delay: Duration::from_millis(5),
            ending: ScriptEnding::Done,
        }
    }
}

impl GenerationScript {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_final(mut self, text: impl Into<String>) -> Self {
        self.final_text = text.into();
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    #[must_use]
    pub fn ending(mut self, ending: ScriptEnding) -> Self {
        self.ending = ending;
        self
    }

    pub fn manual() -> Self {
        Self {
            chunks: Vec::new(),
            ending: ScriptEnding::Manual,
            ..Self::default()
        }
    }
}

/// Counters and captures shared by every engine a factory builds.
#[derive(Default)]
pub struct EngineStats {
    engines_created: AtomicUsize,
    engines_closed: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    cancels: AtomicUsize,
    add_inputs: AtomicUsize,
    generations: AtomicUsize,
    closed_while_generating: AtomicUsize,
    backends: Mutex<Vec<Backend>>,
    callbacks: Mutex<Vec<NativeCallback>>,
    inputs: Mutex<Vec<ModelInput>>,
    params: Mutex<Vec<SamplingParams>>,
}

impl EngineStats {
    pub fn engines_created(&self) -> usize {
        self.engines_created.load(Ordering::SeqCst)
    }

    pub fn engines_closed(&self) -> usize {
        self.engines_closed.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn add_inputs(&self) -> usize {
        self.add_inputs.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    /// Sessions closed while their generation thread was still emitting.
    pub fn closed_while_generating(&self) -> usize {
        self.closed_while_generating.load(Ordering::SeqCst)
    }

    /// Backends requested from the factory, in order.
    pub fn backends(&self) -> Vec<Backend> {
        lock(&self.backends).clone()
    }

    /// Callback passed to the `n`th `generate_async` call.
    pub fn callback(&self, n: usize) -> Option<NativeCallback> {
        lock(&self.callbacks).get(n).cloned()
    }

    pub fn inputs(&self) -> Vec<ModelInput> {
        lock(&self.inputs).clone()
    }

    pub fn params(&self) -> Vec<SamplingParams> {
        lock(&self.params).clone()
    }
}

#[derive(Default)]
struct FactoryConfig {
    script: GenerationScript,
    failing_backends: HashSet<Backend>,
    session_failures: usize,
    add_input_failures: usize,
    emit_after_cancel: bool,
    close_delay: Duration,
}

struct Shared {
    config: Mutex<FactoryConfig>,
    stats: EngineStats,
}

/// Factory producing scripted engines.
#[derive(Clone)]
pub struct ScriptedEngineFactory {
    shared: Arc<Shared>,
}

impl Default for ScriptedEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngineFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(FactoryConfig::default()),
                stats: EngineStats::default(),
            }),
        }
    }

    #[must_use]
    pub fn with_script(self, script: GenerationScript) -> Self {
        self.set_script(script);
        self
    }

    /// Replace the script used by future generations.
    pub fn set_script(&self, script: GenerationScript) {
        lock(&self.shared.config).script = script;
    }

    /// Make engine construction on `backend` fail.
    #[must_use]
    pub fn fail_backend(self, backend: Backend) -> Self {
        lock(&self.shared.config).failing_backends.insert(backend);
        self
    }

    /// Fail the next `times` session builds.
    pub fn fail_session_builds(&self, times: usize) {
        lock(&self.shared.config).session_failures = times;
    }

    /// Fail the next `times` `add_input` calls.
    pub fn fail_add_input(&self, times: usize) {
        lock(&self.shared.config).add_input_failures = times;
    }

    /// Keep emitting (including the terminal event) after `cancel`.
    pub fn emit_after_cancel(&self, enabled: bool) {
        lock(&self.shared.config).emit_after_cancel = enabled;
    }

    /// Make `close` on sessions block for `delay` before returning.
    pub fn set_close_delay(&self, delay: Duration) {
        lock(&self.shared.config).close_delay = delay;
    }

    pub fn stats(&self) -> &EngineStats {
        &self.shared.stats
    }

    pub fn as_factory(&self) -> Arc<dyn EngineFactory> {
        Arc::new(self.clone())
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create_engine(&self, spec: &EngineSpec) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        let stats = &self.shared.stats;
        lock(&stats.backends).push(spec.backend);
        if lock(&self.shared.config).failing_backends.contains(&spec.backend) {
            return Err(EngineError::BackendUnavailable {
                backend: spec.backend,
                reason: "scripted failure".to_string(),
            });
        }
        stats.engines_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedEngine {
            shared: Arc::clone(&self.shared),
            backend: spec.backend,
        }))
    }
}

/// Engine built by [`ScriptedEngineFactory`].
pub struct ScriptedEngine {
    shared: Arc<Shared>,
    backend: Backend,
}

impl InferenceEngine for ScriptedEngine {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_session(
        &self,
        params: &SamplingParams,
    ) -> Result<Arc<dyn InferenceSession>, EngineError> {
        {
            let mut config = lock(&self.shared.config);
            if config.session_failures > 0 {
                config.session_failures -= 1;
                return Err(EngineError::SessionFailed("scripted failure".to_string()));
            }
        }
        lock(&self.shared.stats.params).push(*params);
        self.shared
            .stats
            .sessions_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedSession {
            shared: Arc::clone(&self.shared),
            cancelled: Mutex::new(Arc::new(AtomicBool::new(false))),
            generating: Arc::new(AtomicUsize::new(0)),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        self.shared.stats.engines_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Session replaying the factory's current script.
pub struct ScriptedSession {
    shared: Arc<Shared>,
    /// Cancel flag of the most recent generation.
    cancelled: Mutex<Arc<AtomicBool>>,
    /// Generation threads still emitting.
    generating: Arc<AtomicUsize>,
}

impl InferenceSession for ScriptedSession {
    fn add_input(&self, input: &ModelInput) -> Result<(), EngineError> {
        self.shared.stats.add_inputs.fetch_add(1, Ordering::SeqCst);
        {
            let mut config = lock(&self.shared.config);
            if config.add_input_failures > 0 {
                config.add_input_failures -= 1;
                return Err(EngineError::InputRejected("scripted failure".to_string()));
            }
        }
        lock(&self.shared.stats.inputs).push(input.clone());
        Ok(())
    }

    fn generate_async(&self, callback: NativeCallback) -> Result<(), EngineError> {
        let stats = &self.shared.stats;
        stats.generations.fetch_add(1, Ordering::SeqCst);
        lock(&stats.callbacks).push(Arc::clone(&callback));

        let (script, emit_after_cancel) = {
            let config = lock(&self.shared.config);
            (config.script.clone(), config.emit_after_cancel)
        };
        if script.ending == ScriptEnding::Manual {
            return Ok(());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        *lock(&self.cancelled) = Arc::clone(&cancelled);
        let generating = Arc::clone(&self.generating);
        generating.fetch_add(1, Ordering::SeqCst);

        thread::spawn(move || {
            let stopped = || cancelled.load(Ordering::SeqCst) && !emit_after_cancel;
            for chunk in script.chunks {
                thread::sleep(script.chunk_delay);
                if stopped() {
                    generating.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                callback(NativeEvent::Partial(chunk));
            }
            thread::sleep(script.chunk_delay);
            generating.fetch_sub(1, Ordering::SeqCst);
            if stopped() {
                return;
            }
            match script.ending {
                ScriptEnding::Done => callback(NativeEvent::Done(script.final_text)),
                ScriptEnding::Fail(message) => callback(NativeEvent::Failed(message)),
                ScriptEnding::Silent | ScriptEnding::Manual => {}
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        self.shared.stats.cancels.fetch_add(1, Ordering::SeqCst);
        lock(&self.cancelled).store(true, Ordering::SeqCst);
    }

    fn close(&self) -> Result<(), EngineError> {
        let delay = lock(&self.shared.config).close_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let stats = &self.shared.stats;
        if self.generating.load(Ordering::SeqCst) > 0 {
            stats.closed_while_generating.fetch_add(1, Ordering::SeqCst);
        }
        stats.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
