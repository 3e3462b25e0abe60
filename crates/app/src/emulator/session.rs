use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::lock;

/// Live image-stream session. The timer task owns the client writer, so aborting
/// it also ends that client's response.
struct ImageSession {
    id: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SlotState {
    current: Option<ImageSession>,
    next_id: u64,
    closed: u64,
}

/// Holder of the single active image session.
#[derive(Default)]
pub(crate) struct SessionSlot {
    state: Mutex<SlotState>,
}

impl SessionSlot {
    /// Stop the active session, then install the one started by `spawn`.
    ///
    /// Both happen under one lock, so two session timers never overlap.
    pub(crate) fn replace_with(&self, spawn: impl FnOnce(u64) -> JoinHandle<()>) -> u64 {
        let mut state = lock(&self.state);
        if let Some(previous) = state.current.take() {
            debug!(session = previous.id, "Closing previous image session");
            previous.timer.abort();
            state.closed += 1;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.current = Some(ImageSession {
            id,
            timer: spawn(id),
        });
        id
    }

    /// Stop the active session, if any.
    pub(crate) fn close(&self) -> bool {
        let mut state = lock(&self.state);
        match state.current.take() {
            Some(session) => {
                session.timer.abort();
                state.closed += 1;
                true
            }
            None => false,
        }
    }

    /// Id of the session whose timer is still running.
    #[cfg(test)]
    pub(crate) fn active(&self) -> Option<u64> {
        lock(&self.state)
            .current
            .as_ref()
            .filter(|session| !session.timer.is_finished())
            .map(|session| session.id)
    }

    /// Sessions stopped by replacement or `close`.
    #[cfg(test)]
    pub(crate) fn closed_count(&self) -> u64 {
        lock(&self.state).closed
    }
}
