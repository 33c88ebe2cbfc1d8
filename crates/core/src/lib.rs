//! Core event/action types for the PBFT consensus engine.
//!
//! This crate defines the boundary of the deterministic state machine:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait the engine implements
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use traits::StateMachine;

/// Identifies one of the engine's timers.
///
/// At most one instance of each timer is pending at a time; setting a timer
/// that is already pending reschedules it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Fires when no block has been finalized for the idle interval.
    Idle,
    /// Fires when an accepted proposal fails to finalize in time.
    Commit,
    /// Fires when an in-progress view change stalls; escalates to the
    /// next view.
    ViewChange,
}
