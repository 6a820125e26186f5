use std::sync::{Mutex, MutexGuard};

use crate::error::SessionExit;

/// A transport-level condition that ends the session at the next check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    Disconnected,
    TransportError(String),
}

impl From<TripReason> for SessionExit {
    fn from(reason: TripReason) -> Self {
        match reason {
            TripReason::Disconnected => SessionExit::Disconnected,
            TripReason::TransportError(message) => SessionExit::Transport(message),
        }
    }
}

#[derive(Debug, Default)]
struct CounterState {
    count: u32,
    /// Sticky: a later data event does not undo a trip.
    trip: Option<TripReason>,
}

/// Idle-poll counter shared between the wait loop and the event handler.
#[derive(Debug, Default)]
pub struct LivenessCounter {
    state: Mutex<CounterState>,
}

impl LivenessCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.state().count
    }

    /// Inbound data arrived.
    pub fn reset(&self) {
        let mut state = self.state();
        if state.trip.is_none() {
            state.count = 0;
        }
    }

    pub fn bump(&self, step: u32) -> u32 {
        let mut state = self.state();
        state.count = state.count.saturating_add(step);
        state.count
    }

    pub fn trip(&self, reason: TripReason, step: u32) {
        let mut state = self.state();
        state.count = state.count.saturating_add(step);
        if state.trip.is_none() {
            state.trip = Some(reason);
        }
    }

    /// Returns the exit the session should take, if the counter has crossed
    /// `threshold` or a trip was recorded.
    pub fn check(&self, threshold: u32) -> Option<SessionExit> {
        let state = self.state();
        if let Some(reason) = state.trip.clone() {
            return Some(reason.into());
        }
        (state.count >= threshold).then(|| SessionExit::IdleExhausted {
            cycles: state.count,
        })
    }

    fn state(&self) -> MutexGuard<'_, CounterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
