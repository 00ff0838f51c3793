//! Model handle: the live engine/session pair plus its generation bookkeeping.
//!
//! The handle is shared between the session manager, the streaming bridge
//! and native callback threads. Locking discipline:
//!
//! - the pair lock guards only the `Option<ResourcePair>` slot; it is never
//!   held while a native engine or session is closed
//! - run state and the generation token are lock-free atomics so that busy
//!   checks from callback threads never block on the pair lock
//! - cleanup listeners live behind their own small lock so that a listener
//!   can be invoked without holding anything else

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use surveycoach_core::{Backend, InferenceConfig, InferenceEngine, InferenceSession};
use tracing::{debug, warn};

/// Invoked once when a specific generation's terminal event fires.
pub type CleanupListener = Box<dyn FnOnce() + Send>;

/// Lifecycle of the handle's current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// No generation in flight.
    Idle = 0,
    /// A generation owns the handle.
    Running = 1,
    /// A cancel is in progress; transient.
    Cancelling = 2,
}

impl RunState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Cancelling,
            _ => Self::Idle,
        }
    }
}

/// An engine and the session built on it, always created and destroyed
/// together.
pub(crate) struct ResourcePair {
    /// Identity of the engine; a session swap is only valid against the
    /// pair it was built from.
    pub id: u64,
    pub engine: Arc<dyn InferenceEngine>,
    pub session: Arc<dyn InferenceSession>,
}

impl ResourcePair {
    /// Close the session, then the engine. Errors are logged and swallowed.
    pub fn destroy(self, handle_name: &str) {
        if let Err(e) = self.session.close() {
            warn!(handle = %handle_name, pair = self.id, error = %e, "Session close failed");
        }
        if let Err(e) = self.engine.close() {
            warn!(handle = %handle_name, pair = self.id, error = %e, "Engine close failed");
        }
        debug!(handle = %handle_name, pair = self.id, "Resource pair destroyed");
    }
}

/// Engine snapshot taken without holding the pair lock across native calls.
pub(crate) struct EngineSnapshot {
    pub id: u64,
    pub engine: Arc<dyn InferenceEngine>,
}

/// Session snapshot for feeding and cancelling outside the pair lock.
pub(crate) struct SessionSnapshot {
    pub id: u64,
    pub session: Arc<dyn InferenceSession>,
}

/// A named, long-lived owner of one engine/session pair.
///
/// Create with [`ModelHandle::new`], populate with
/// [`SessionManager::initialize`](crate::SessionManager::initialize).
pub struct ModelHandle {
    name: String,
    config: RwLock<InferenceConfig>,
    pair: Mutex<Option<ResourcePair>>,
    backend: Mutex<Option<Backend>>,
    run_state: AtomicU8,
    generation: AtomicU64,
    pending_cleanup: AtomicBool,
    next_pair_id: AtomicU64,
    listeners: Mutex<Vec<(u64, CleanupListener)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelHandle {
    /// Create an empty handle. No native resources are built.
    pub fn new(name: impl Into<String>, config: InferenceConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config: RwLock::new(config),
            pair: Mutex::new(None),
            backend: Mutex::new(None),
            run_state: AtomicU8::new(RunState::Idle as u8),
            generation: AtomicU64::new(0),
            pending_cleanup: AtomicBool::new(false),
            next_pair_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration last passed to `initialize`.
    pub fn config(&self) -> InferenceConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_config(&self, config: InferenceConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    // ── Run state ──────────────────────────────────────────────────────

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.run_state() == RunState::Idle
    }

    /// Anything other than `Idle` counts as busy.
    pub fn is_busy(&self) -> bool {
        !self.is_idle()
    }

    /// Current generation token.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether an engine/session pair is live.
    pub fn is_initialized(&self) -> bool {
        lock(&self.pair).is_some()
    }

    /// Backend the live engine was constructed on.
    pub fn backend(&self) -> Option<Backend> {
        *lock(&self.backend)
    }

    /// Whether a cleanup request is waiting for the current generation to end.
    pub fn cleanup_pending(&self) -> bool {
        self.pending_cleanup.load(Ordering::Acquire)
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.run_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically claim the handle for a new generation.
    pub(crate) fn try_claim(&self) -> bool {
        self.transition(RunState::Idle, RunState::Running)
    }

    /// Claim the handle and take the new generation's token.
    ///
    /// Runs under the pair lock so a concurrent session swap either lands
    /// before the claim or sees the handle busy and backs off.
    pub(crate) fn claim_generation(&self) -> Option<u64> {
        let _slot = lock(&self.pair);
        self.try_claim().then(|| self.advance_generation())
    }

    /// Atomically move a running generation into cancellation.
    pub(crate) fn begin_cancel(&self) -> bool {
        self.transition(RunState::Running, RunState::Cancelling)
    }

    /// Release a running generation. Fails if a cancel got there first.
    pub(crate) fn finish_running(&self) -> bool {
        self.transition(RunState::Running, RunState::Idle)
    }

    pub(crate) fn set_idle(&self) {
        self.run_state
            .store(RunState::Idle as u8, Ordering::Release);
    }

    /// Bump the generation token and return the new value.
    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    // ── Cleanup listeners ──────────────────────────────────────────────

    pub(crate) fn register_cleanup(&self, token: u64, listener: CleanupListener) {
        lock(&self.listeners).push((token, listener));
    }

    /// Remove and return the listener for `token`, if still registered.
    pub(crate) fn take_cleanup(&self, token: u64) -> Option<CleanupListener> {
        let mut listeners = lock(&self.listeners);
        let index = listeners.iter().position(|(t, _)| *t == token)?;
        Some(listeners.swap_remove(index).1)
    }

    pub(crate) fn mark_cleanup_pending(&self) {
        self.pending_cleanup.store(true, Ordering::Release);
    }

    /// Consume the pending-cleanup flag. Only one caller ever sees `true`.
    pub(crate) fn take_cleanup_pending(&self) -> bool {
        self.pending_cleanup.swap(false, Ordering::AcqRel)
    }

    // ── Resource pair ──────────────────────────────────────────────────

    pub(crate) fn engine_snapshot(&self) -> Option<EngineSnapshot> {
        lock(&self.pair).as_ref().map(|pair| EngineSnapshot {
            id: pair.id,
            engine: Arc::clone(&pair.engine),
        })
    }

    pub(crate) fn session_snapshot(&self) -> Option<SessionSnapshot> {
        lock(&self.pair).as_ref().map(|pair| SessionSnapshot {
            id: pair.id,
            session: Arc::clone(&pair.session),
        })
    }

    /// Detach the pair ahead of a re-initialize.
    ///
    /// Fails with `Err(())` if a pair exists and the handle is busy. Clears
    /// any pending cleanup, since the fresh pair supersedes it.
    pub(crate) fn detach_for_initialize(&self) -> Result<Option<ResourcePair>, ()> {
        let mut slot = lock(&self.pair);
        if slot.is_some() && self.is_busy() {
            return Err(());
        }
        self.pending_cleanup.store(false, Ordering::Release);
        *lock(&self.backend) = None;
        Ok(slot.take())
    }

    /// Detach the pair if no generation is in flight.
    ///
    /// `Err(())` means the handle is busy and nothing was detached.
    pub(crate) fn detach_if_idle(&self) -> Result<Option<ResourcePair>, ()> {
        let mut slot = lock(&self.pair);
        if self.is_busy() {
            return Err(());
        }
        *lock(&self.backend) = None;
        Ok(slot.take())
    }

    /// Detach the pair unconditionally. Caller owns the run state.
    pub(crate) fn detach(&self) -> Option<ResourcePair> {
        let mut slot = lock(&self.pair);
        *lock(&self.backend) = None;
        slot.take()
    }

    /// Publish a freshly built pair, returning any pair it displaced.
    pub(crate) fn publish(
        &self,
        engine: Arc<dyn InferenceEngine>,
        session: Arc<dyn InferenceSession>,
    ) -> Option<ResourcePair> {
        let id = self.next_pair_id.fetch_add(1, Ordering::Relaxed);
        let backend = engine.backend();
        let mut slot = lock(&self.pair);
        *lock(&self.backend) = Some(backend);
        slot.replace(ResourcePair {
            id,
            engine,
            session,
        })
    }

    /// Swap in a new session if the pair is still `pair_id` and the run
    /// state is `required`. Returns the old session on success and hands the
    /// new one back on failure.
    ///
    /// A swap on an idle handle also advances the generation token, inside
    /// the same critical section as the state check. A swap on a running
    /// handle keeps the token: the running generation continues on the new
    /// session.
    pub(crate) fn swap_session(
        &self,
        pair_id: u64,
        required: RunState,
        fresh: Arc<dyn InferenceSession>,
    ) -> Result<Arc<dyn InferenceSession>, Arc<dyn InferenceSession>> {
        let mut slot = lock(&self.pair);
        match slot.as_mut() {
            Some(pair) if pair.id == pair_id && self.run_state() == required => {
                if required == RunState::Idle {
                    self.advance_generation();
                }
                Ok(std::mem::replace(&mut pair.session, fresh))
            }
            _ => Err(fresh),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("run_state", &self.run_state())
            .field("generation", &self.generation())
            .field("initialized", &self.is_initialized())
            .field("cleanup_pending", &self.cleanup_pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn handle() -> Arc<ModelHandle> {
        ModelHandle::new("test", InferenceConfig::for_model("/models/test.bin"))
    }

    #[test]
    fn claim_is_exclusive() {
        let h = handle();
        assert!(h.try_claim());
        assert!(!h.try_claim());
        assert_eq!(h.run_state(), RunState::Running);
        assert!(h.finish_running());
        assert!(h.is_idle());
    }

    #[test]
    fn cancel_beats_finish() {
        let h = handle();
        assert!(h.try_claim());
        assert!(h.begin_cancel());
        assert!(!h.finish_running());
        assert_eq!(h.run_state(), RunState::Cancelling);
        h.set_idle();
        assert!(!h.begin_cancel());
    }

    #[test]
    fn generation_advances() {
        let h = handle();
        assert_eq!(h.generation(), 0);
        assert_eq!(h.advance_generation(), 1);
        assert_eq!(h.advance_generation(), 2);
        assert_eq!(h.generation(), 2);
    }

    #[test]
    fn claim_takes_the_next_token() {
        let h = handle();
        assert_eq!(h.claim_generation(), Some(1));
        assert_eq!(h.claim_generation(), None);
        assert_eq!(h.generation(), 1);
        assert!(h.finish_running());
        assert_eq!(h.claim_generation(), Some(2));
    }

    #[test]
    fn cleanup_listener_taken_once() {
        let h = handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        h.register_cleanup(
            7,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(h.take_cleanup(6).is_none());
        let listener = h.take_cleanup(7).expect("registered");
        listener();
        assert!(h.take_cleanup(7).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_cleanup_consumed_once() {
        let h = handle();
        assert!(!h.take_cleanup_pending());
        h.mark_cleanup_pending();
        assert!(h.cleanup_pending());
        assert!(h.take_cleanup_pending());
        assert!(!h.take_cleanup_pending());
    }

    #[test]
    fn uninitialized_detach_is_empty() {
        let h = handle();
        assert!(matches!(h.detach_if_idle(), Ok(None)));
        assert!(matches!(h.detach_for_initialize(), Ok(None)));
        assert!(h.engine_snapshot().is_none());
        assert!(h.session_snapshot().is_none());
    }
}
