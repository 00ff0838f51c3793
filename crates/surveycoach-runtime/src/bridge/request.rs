//! The task driving one bridged request from gate to close.

use std::sync::{Arc, Mutex, PoisonError};

use surveycoach_core::{InferenceError, ModelInput};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::PartialBuffer;
use super::state::StreamState;
use super::watchdog::{self, Quiescence};
use super::{BridgeSettings, StreamChunk};
use crate::handle::{CleanupListener, ModelHandle};
use crate::manager::{BusyPolicy, Partial, PartialListener, SessionManager};

enum Forwarded {
    Sent,
    /// The receiver is gone.
    Closed,
    /// Cancelled or timed out while waiting for channel capacity.
    Interrupted(InferenceError),
}

enum Outcome {
    /// Terminal partial from a generation that ran.
    Finished,
    /// Rejected before claiming the handle; nothing to settle.
    Rejected,
    /// Consumer cancellation or request timeout.
    Interrupted(InferenceError),
}

pub(super) struct Request {
    pub manager: Arc<SessionManager>,
    pub handle: Arc<ModelHandle>,
    pub gate: Arc<Semaphore>,
    pub settings: BridgeSettings,
    pub input: ModelInput,
    pub policy: BusyPolicy,
    pub tx: mpsc::Sender<StreamChunk>,
    pub cancel: CancellationToken,
    pub state: Arc<StreamState>,
}

impl Request {
    pub(super) async fn run(self) {
        let Self {
            manager,
            handle,
            gate,
            settings,
            input,
            policy,
            tx,
            cancel,
            state,
        } = self;

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(handle = %handle.name(), "Request cancelled while waiting for gate");
                state.mark_cancelled();
                state.close();
                return;
            }
            permit = gate.acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            warn!(handle = %handle.name(), "Generation gate closed");
            state.close();
            return;
        };
        state.mark_streaming();

        let buffer = Arc::new(PartialBuffer::new(settings.buffer_capacity));
        let accumulated = Arc::new(Mutex::new(String::new()));
        let on_partial: PartialListener = {
            let buffer = Arc::clone(&buffer);
            let accumulated = Arc::clone(&accumulated);
            Arc::new(move |partial: Partial| buffer.push(accumulate(&accumulated, partial)))
        };
        let on_clean: CleanupListener = {
            let state = Arc::clone(&state);
            Box::new(move || state.mark_cleaned())
        };

        let started = {
            let manager = Arc::clone(&manager);
            let handle = Arc::clone(&handle);
            tokio::task::spawn_blocking(move || {
                manager.run_inference(&handle, input, policy, on_partial, on_clean);
            })
        };
        if let Err(e) = started.await {
            warn!(handle = %handle.name(), error = %e, "run_inference task failed");
        }

        let deadline = settings.request_timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => break Outcome::Interrupted(InferenceError::Cancelled),
                () = until(deadline) => break Outcome::Interrupted(InferenceError::Timeout),
                chunk = buffer.pop() => chunk,
            };

            let is_final = chunk.is_final;
            let rejected = chunk.error.as_ref().is_some_and(is_rejection);
            if is_final {
                state.mark_finished();
            }
            match forward(&tx, chunk, &cancel, deadline).await {
                Forwarded::Sent => {}
                Forwarded::Closed => {
                    debug!(handle = %handle.name(), "Consumer gone, chunk not forwarded");
                    state.record_forward_failure();
                }
                Forwarded::Interrupted(error) => break Outcome::Interrupted(error),
            }
            if is_final {
                break if rejected {
                    Outcome::Rejected
                } else {
                    Outcome::Finished
                };
            }
        };

        match outcome {
            Outcome::Rejected => {
                debug!(handle = %handle.name(), "Request rejected before start");
            }
            Outcome::Finished => {
                match watchdog::await_quiescence(&handle, &state, &settings, &cancel).await {
                    Quiescence::Cleaned | Quiescence::IdleGrace => {}
                    Quiescence::TimedOut => {
                        warn!(
                            handle = %handle.name(),
                            timeout_ms = settings.watchdog_timeout.as_millis(),
                            "Cleanup not observed, force closing request"
                        );
                    }
                    Quiescence::Interrupted => {
                        watchdog::settle(&manager, &handle, &state, &settings).await;
                    }
                }
            }
            Outcome::Interrupted(error) => {
                info!(handle = %handle.name(), reason = error.kind(), "Request interrupted");
                state.mark_cancelled();
                watchdog::settle(&manager, &handle, &state, &settings).await;

                let text = accumulated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let terminal = StreamChunk {
                    text,
                    delta: String::new(),
                    is_final: true,
                    error: Some(error),
                };
                if !matches!(timeout(settings.settle_timeout, tx.send(terminal)).await, Ok(Ok(()))) {
                    state.record_forward_failure();
                }
            }
        }

        if buffer.dropped() > 0 {
            debug!(handle = %handle.name(), dropped = buffer.dropped(), "Partials dropped under backpressure");
        }
        state.close();
        drop(permit);
    }
}

/// Fold one manager partial into the running text.
fn accumulate(accumulated: &Mutex<String>, partial: Partial) -> StreamChunk {
    let mut text = accumulated.lock().unwrap_or_else(PoisonError::into_inner);
    match partial.error {
        Some(error) => StreamChunk {
            text: text.clone(),
            delta: String::new(),
            is_final: true,
            error: Some(error),
        },
        None => {
            text.push_str(&partial.text);
            StreamChunk {
                text: text.clone(),
                delta: partial.text,
                is_final: partial.done,
                error: None,
            }
        }
    }
}

/// Errors raised before the handle was claimed.
const fn is_rejection(error: &InferenceError) -> bool {
    matches!(
        error,
        InferenceError::NotInitialized | InferenceError::Busy | InferenceError::EmptyInput
    )
}

/// Send one chunk, giving up if the request is cancelled or its deadline
/// passes while the channel is full.
async fn forward(
    tx: &mpsc::Sender<StreamChunk>,
    chunk: StreamChunk,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Forwarded {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Forwarded::Interrupted(InferenceError::Cancelled),
        () = until(deadline) => Forwarded::Interrupted(InferenceError::Timeout),
        sent = tx.send(chunk) => match sent {
            Ok(()) => Forwarded::Sent,
            Err(_) => Forwarded::Closed,
        },
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
