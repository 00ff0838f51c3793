//! Post-terminal watchdog and interruption settling.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::BridgeSettings;
use super::state::StreamState;
use crate::handle::ModelHandle;
use crate::manager::SessionManager;

/// Why the watchdog stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Quiescence {
    /// The cleanup listener fired.
    Cleaned,
    /// The handle stayed idle for the grace window.
    IdleGrace,
    /// Neither happened before the watchdog timeout.
    TimedOut,
    /// The consumer went away while waiting.
    Interrupted,
}

/// Poll the handle after the terminal partial until it is quiet.
pub(crate) async fn await_quiescence(
    handle: &ModelHandle,
    state: &StreamState,
    settings: &BridgeSettings,
    cancel: &CancellationToken,
) -> Quiescence {
    let started = Instant::now();
    let mut idle_since: Option<Instant> = None;
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Quiescence::Interrupted,
            () = state.cleaned() => return Quiescence::Cleaned,
            _ = ticker.tick() => {}
        }

        if handle.is_idle() {
            let since = *idle_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= settings.idle_grace {
                debug!(handle = %handle.name(), "Handle idle through grace window");
                return Quiescence::IdleGrace;
            }
        } else {
            idle_since = None;
        }

        if started.elapsed() >= settings.watchdog_timeout {
            return Quiescence::TimedOut;
        }
    }
}

/// Bring the handle back to a usable state after the consumer cancelled,
/// closed, or the request timed out.
pub(crate) async fn settle(
    manager: &Arc<SessionManager>,
    handle: &Arc<ModelHandle>,
    state: &StreamState,
    settings: &BridgeSettings,
) {
    if state.seen_cleaned() {
        wait_until_quiet(handle, None, settings).await;
        return;
    }

    if handle.is_busy() {
        debug!(handle = %handle.name(), "Cancelling in-flight generation");
        manager.cancel(handle);
        if !wait_until_quiet(handle, Some(state), settings).await {
            warn!(handle = %handle.name(), "Handle did not settle after cancel");
        }
        if state.seen_finished() && !state.seen_cleaned() {
            reset_session(manager, handle).await;
        }
        return;
    }

    if state.seen_finished() {
        reset_session(manager, handle).await;
    }
}

/// Wait for the handle to go idle. Bounded by the settle timeout.
pub(crate) async fn wait_until_idle(handle: &ModelHandle, settings: &BridgeSettings) -> bool {
    wait_until_quiet(handle, None, settings).await
}

/// Wait for the handle to go idle or, given a request state, for its
/// cleanup listener.
async fn wait_until_quiet(
    handle: &ModelHandle,
    state: Option<&StreamState>,
    settings: &BridgeSettings,
) -> bool {
    let deadline = Instant::now() + settings.settle_timeout;
    loop {
        if handle.is_idle() || state.is_some_and(StreamState::seen_cleaned) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(settings.poll_interval).await;
    }
}

/// Run `reset_session` off the async workers.
pub(crate) async fn reset_session(manager: &Arc<SessionManager>, handle: &Arc<ModelHandle>) -> bool {
    let manager = Arc::clone(manager);
    let target = Arc::clone(handle);
    match tokio::task::spawn_blocking(move || manager.reset_session(&target)).await {
        Ok(true) => {
            debug!(handle = %handle.name(), "Session reset");
            true
        }
        Ok(false) => {
            debug!(handle = %handle.name(), "Session reset skipped");
            false
        }
        Err(e) => {
            warn!(handle = %handle.name(), error = %e, "Session reset task failed");
            false
        }
    }
}
