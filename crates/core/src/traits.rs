//! The state machine trait implemented by the engine.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// The runner owns the clock: it calls [`StateMachine::set_time`] before
/// delivering each event, so the machine never reads wall time itself. Given
/// the same sequence of `set_time`/`handle` calls, any two instances produce
/// the same actions.
pub trait StateMachine {
    /// Advance the machine's notion of "now".
    ///
    /// Monotonic: runners never move time backwards.
    fn set_time(&mut self, now: Duration);

    /// Process one event and return the actions it caused.
    ///
    /// Invalid or stale input never panics; it is logged and dropped,
    /// producing no actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
