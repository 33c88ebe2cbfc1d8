//! Engine error types.

use pbft_types::ViewNumber;

/// Errors surfaced by the consensus engine's own state transitions.
///
/// Protocol violations by peers are not errors; they are classified reject
/// outcomes (see [`crate::message_log::RejectReason`]) that never leave the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PbftError {
    /// A view advance was requested for a view at or below the current one.
    #[error("cannot advance to view {requested}, current view is {current}")]
    StaleView {
        requested: ViewNumber,
        current: ViewNumber,
    },
}
