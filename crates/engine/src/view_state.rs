//! Current view tracking.

use crate::error::PbftError;
use pbft_types::{Membership, PeerId, ViewNumber};
use tracing::debug;

/// Whether the node is making normal progress or replacing its primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal three-phase operation under the current primary.
    Normal,
    /// A view change is in progress; normal proposals are not accepted.
    ViewChanging,
}

/// Tracks the current view and operating mode.
///
/// The view only moves forward. The primary is derived from the view and the
/// membership, never stored, so the two can not disagree.
#[derive(Debug, Clone)]
pub struct ViewState {
    view: ViewNumber,
    mode: Mode,
}

impl ViewState {
    pub fn new() -> Self {
        Self {
            view: 0,
            mode: Mode::Normal,
        }
    }

    pub fn current_view(&self) -> ViewNumber {
        self.view
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The primary for the current view.
    pub fn current_primary(&self, membership: &Membership) -> PeerId {
        membership.primary_for(self.view)
    }

    /// Whether `peer` is the primary for the current view.
    pub fn is_primary(&self, membership: &Membership, peer: &PeerId) -> bool {
        self.current_primary(membership) == *peer
    }

    /// Advance to a strictly later view.
    pub fn advance_to(&mut self, view: ViewNumber) -> Result<(), PbftError> {
        if view <= self.view {
            return Err(PbftError::StaleView {
                requested: view,
                current: self.view,
            });
        }
        debug!(from = self.view, to = view, "advancing view");
        self.view = view;
        Ok(())
    }

    /// Enter view-changing mode. Idempotent.
    pub fn enter_view_changing(&mut self) {
        self.mode = Mode::ViewChanging;
    }

    /// Install a new view and return to normal operation.
    pub fn exit_view_changing(&mut self, new_view: ViewNumber) -> Result<(), PbftError> {
        self.advance_to(new_view)?;
        self.mode = Mode::Normal;
        Ok(())
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn membership() -> Membership {
        Membership::new((0..4).map(peer).collect()).unwrap()
    }

    #[test]
    fn test_starts_in_view_zero_normal() {
        let state = ViewState::new();
        assert_eq!(state.current_view(), 0);
        assert_eq!(state.mode(), Mode::Normal);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = ViewState::new();
        state.advance_to(3).unwrap();
        assert_eq!(state.current_view(), 3);

        // Same view and earlier views are stale; state is unchanged.
        assert_eq!(
            state.advance_to(3),
            Err(PbftError::StaleView {
                requested: 3,
                current: 3
            })
        );
        assert_eq!(
            state.advance_to(1),
            Err(PbftError::StaleView {
                requested: 1,
                current: 3
            })
        );
        assert_eq!(state.current_view(), 3);
    }

    #[test]
    fn test_exit_view_changing_installs_view() {
        let mut state = ViewState::new();
        state.enter_view_changing();
        assert_eq!(state.mode(), Mode::ViewChanging);

        state.exit_view_changing(1).unwrap();
        assert_eq!(state.mode(), Mode::Normal);
        assert_eq!(state.current_view(), 1);

        // Installing a stale view fails and stays in the current mode.
        state.enter_view_changing();
        assert!(state.exit_view_changing(1).is_err());
        assert_eq!(state.mode(), Mode::ViewChanging);
    }

    #[test]
    fn test_primary_tracks_view() {
        let members = membership();
        let mut state = ViewState::new();
        assert_eq!(state.current_primary(&members), peer(0));
        assert!(state.is_primary(&members, &peer(0)));

        state.advance_to(2).unwrap();
        assert_eq!(state.current_primary(&members), peer(2));
        assert!(!state.is_primary(&members, &peer(0)));
    }
}
