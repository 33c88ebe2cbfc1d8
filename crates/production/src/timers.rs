//! Timer deadline table for the production runner.
//!
//! The state machine owns timer semantics; the runner only tracks deadlines.
//! Timers are single-shot: a fired timer stays dead until the state machine
//! sets it again. Starting a timer that is already pending reschedules it.

use pbft_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Convert a fired timer into the event the state machine expects.
pub fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Idle => Event::IdleTimeout,
        TimerId::Commit => Event::CommitTimeout,
        TimerId::ViewChange => Event::ViewChangeTimeout,
    }
}

/// Pending timer deadlines, polled by the runner's event loop.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerId, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` to fire after `duration`, replacing any pending deadline.
    pub fn start(&mut self, id: TimerId, duration: Duration) {
        debug!(?id, ?duration, "timer set");
        self.deadlines.insert(id, Instant::now() + duration);
    }

    /// Disarm `id`. A no-op if the timer is not pending.
    pub fn cancel(&mut self, id: TimerId) {
        if self.deadlines.remove(&id).is_some() {
            debug!(?id, "timer cancelled");
        }
    }

    /// The earliest pending deadline, if any. The runner sleeps until this.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired: Vec<(TimerId, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*id, *deadline))
            .collect();
        fired.sort_by_key(|(_, deadline)| *deadline);
        for (id, _) in &fired {
            self.deadlines.remove(id);
        }
        fired.into_iter().map(|(id, _)| id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.deadlines.len()
    }
}
