//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use pbft_types::{ConsensusMessage, Hash, SequenceNumber};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a signed message to every other member of the network.
    ///
    /// The engine records its own copy before emitting this, so runners
    /// deliver to peers only; a loopback would be ignored as a duplicate.
    Broadcast { message: ConsensusMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Reschedules if already pending.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer. Cancelling an idle timer is a no-op.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality. Used to replay
    /// the re-proposals carried by a validated NewView.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Ledger
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask the ledger for a block candidate at a sequence number.
    ///
    /// Emitted by the primary when it is ready to propose. The runner
    /// answers with `Event::BlockCandidateReady` after the configured
    /// publishing delay.
    RequestBlockCandidate { sequence: SequenceNumber },

    /// A proposal gathered a commit quorum; hand it to the ledger as final.
    ///
    /// Finalization is in strict sequence order, exactly once per sequence
    /// number.
    FinalizeBlock {
        sequence: SequenceNumber,
        digest: Hash,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist an accepted message so the log survives a restart.
    PersistMessage { message: ConsensusMessage },

    /// Drop persisted messages at or below a sequence number. Emitted after
    /// finalization advances the low-water mark.
    CompactLog { up_to: SequenceNumber },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::RequestBlockCandidate { .. } => "RequestBlockCandidate",
            Action::FinalizeBlock { .. } => "FinalizeBlock",
            Action::PersistMessage { .. } => "PersistMessage",
            Action::CompactLog { .. } => "CompactLog",
        }
    }
}
