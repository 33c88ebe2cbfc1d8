//! Deterministic ordering for the global simulation event queue.

use pbft_core::Event;
use std::time::Duration;

/// Index of a node within the simulation.
pub type NodeIndex = u32;

/// Ordering key for queued events.
///
/// Events are processed by time, then priority (internal before timers
/// before network), then node index, then insertion order. The trailing
/// sequence number makes every key unique, so two runs with the same seed
/// pop events in exactly the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: u8,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority() as u8,
            node_index,
            sequence,
        }
    }

    /// Key for an event re-enqueued by the node itself. Uses the Internal
    /// priority so it is processed before anything else at the same time,
    /// regardless of the wrapped event's own kind.
    pub fn internal(time: Duration, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: pbft_core::EventPriority::Internal as u8,
            node_index,
            sequence,
        }
    }
}
