//! Event types for the deterministic state machine.

use pbft_types::{
    BlockCandidate, CommitMessage, NewViewMessage, PrePrepareMessage, PrepareMessage,
    ViewChangeMessage,
};
use std::collections::HashMap;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client events: inputs from the node's collaborators (ledger,
    /// settings source).
    Client = 3,
}

/// All possible events the engine can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// No block has been finalized within the idle interval. The primary
    /// is presumed faulty; trigger a view change.
    IdleTimeout,

    /// An accepted proposal did not finalize within the commit interval.
    CommitTimeout,

    /// An in-progress view change made no progress; escalate to the next
    /// view.
    ViewChangeTimeout,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // Sender identity comes from message signatures, not a `from` field.
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a proposal from the primary.
    PrePrepareReceived { message: PrePrepareMessage },

    /// Received a prepare vote.
    PrepareReceived { message: PrepareMessage },

    /// Received a commit vote.
    CommitReceived { message: CommitMessage },

    /// Received a view-change vote.
    ViewChangeReceived { message: ViewChangeMessage },

    /// Received a new-view announcement from the claimed next primary.
    NewViewReceived { message: NewViewMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborator Inputs (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// The ledger produced a block candidate in response to
    /// `Action::RequestBlockCandidate`. Only the primary receives these.
    BlockCandidateReady { candidate: BlockCandidate },

    /// On-chain settings changed at a block boundary. Raw key/value pairs;
    /// the engine parses and applies what it recognizes.
    SettingsUpdated { settings: HashMap<String, String> },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::IdleTimeout | Event::CommitTimeout | Event::ViewChangeTimeout => {
                EventPriority::Timer
            }

            Event::PrePrepareReceived { .. }
            | Event::PrepareReceived { .. }
            | Event::CommitReceived { .. }
            | Event::ViewChangeReceived { .. }
            | Event::NewViewReceived { .. } => EventPriority::Network,

            Event::BlockCandidateReady { .. } | Event::SettingsUpdated { .. } => {
                EventPriority::Client
            }
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::IdleTimeout => "IdleTimeout",
            Event::CommitTimeout => "CommitTimeout",
            Event::ViewChangeTimeout => "ViewChangeTimeout",
            Event::PrePrepareReceived { .. } => "PrePrepareReceived",
            Event::PrepareReceived { .. } => "PrepareReceived",
            Event::CommitReceived { .. } => "CommitReceived",
            Event::ViewChangeReceived { .. } => "ViewChangeReceived",
            Event::NewViewReceived { .. } => "NewViewReceived",
            Event::BlockCandidateReady { .. } => "BlockCandidateReady",
            Event::SettingsUpdated { .. } => "SettingsUpdated",
        }
    }
}
