//! Per-request state machine.
//!
//! `Started → Streaming → {Finished | Cancelled} → Closed`. `Closed` is
//! reached exactly once; everything else only moves forward.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamPhase {
    /// Waiting for the generation gate.
    Started = 0,
    /// Generation running; partials flowing.
    Streaming = 1,
    /// Terminal partial observed; waiting for the handle to settle.
    Finished = 2,
    /// Interrupted by the consumer or the request timeout.
    Cancelled = 3,
    /// Done. The gate has been (or is being) released.
    Closed = 4,
}

impl StreamPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Started,
            1 => Self::Streaming,
            2 => Self::Finished,
            3 => Self::Cancelled,
            _ => Self::Closed,
        }
    }
}

/// Observations shared between the request task, the manager callbacks
/// and the consumer.
#[derive(Debug)]
pub struct StreamState {
    phase: AtomicU8,
    seen_finished: AtomicBool,
    seen_cleaned: AtomicBool,
    forward_failures: AtomicUsize,
    cleaned: Notify,
    closed: Notify,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(StreamPhase::Started as u8),
            seen_finished: AtomicBool::new(false),
            seen_cleaned: AtomicBool::new(false),
            forward_failures: AtomicUsize::new(0),
            cleaned: Notify::new(),
            closed: Notify::new(),
        }
    }
}

impl StreamState {
    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// The terminal partial reached the bridge.
    pub fn seen_finished(&self) -> bool {
        self.seen_finished.load(Ordering::Acquire)
    }

    /// The manager fired this request's cleanup listener.
    pub fn seen_cleaned(&self) -> bool {
        self.seen_cleaned.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == StreamPhase::Closed
    }

    /// Chunks that could not be delivered to the consumer.
    pub fn forward_failures(&self) -> usize {
        self.forward_failures.load(Ordering::Relaxed)
    }

    fn advance(&self, from: StreamPhase, to: StreamPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_streaming(&self) {
        self.advance(StreamPhase::Started, StreamPhase::Streaming);
    }

    pub(crate) fn mark_finished(&self) {
        self.seen_finished.store(true, Ordering::Release);
        self.advance(StreamPhase::Streaming, StreamPhase::Finished);
    }

    pub(crate) fn mark_cancelled(&self) {
        if !self.advance(StreamPhase::Streaming, StreamPhase::Cancelled) {
            self.advance(StreamPhase::Started, StreamPhase::Cancelled);
        }
    }

    pub(crate) fn mark_cleaned(&self) {
        self.seen_cleaned.store(true, Ordering::Release);
        self.cleaned.notify_waiters();
    }

    pub(crate) fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Move to `Closed`. Returns `true` only for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        let previous = self
            .phase
            .swap(StreamPhase::Closed as u8, Ordering::AcqRel);
        let first = previous != StreamPhase::Closed as u8;
        if first {
            self.closed.notify_waiters();
        }
        first
    }

    /// Resolve once the cleanup listener has fired.
    pub async fn cleaned(&self) {
        loop {
            let notified = self.cleaned.notified();
            if self.seen_cleaned() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once the request is closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let state = StreamState::default();
        assert_eq!(state.phase(), StreamPhase::Started);
        state.mark_streaming();
        state.mark_finished();
        assert_eq!(state.phase(), StreamPhase::Finished);
        assert!(state.seen_finished());

        // Late interruption does not rewrite a finished request.
        state.mark_cancelled();
        assert_eq!(state.phase(), StreamPhase::Finished);
    }

    #[test]
    fn closes_exactly_once() {
        let state = StreamState::default();
        state.mark_streaming();
        state.mark_cancelled();
        assert_eq!(state.phase(), StreamPhase::Cancelled);
        assert!(state.close());
        assert!(!state.close());
        assert!(state.is_closed());
    }

    #[tokio::test]
    async fn waiters_wake_on_close_and_cleanup() {
        let state = std::sync::Arc::new(StreamState::default());
        let waiter = {
            let state = std::sync::Arc::clone(&state);
            tokio::spawn(async move {
                state.cleaned().await;
                state.wait_closed().await;
            })
        };
        tokio::task::yield_now().await;
        state.mark_cleaned();
        state.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("task ok");
    }
}
