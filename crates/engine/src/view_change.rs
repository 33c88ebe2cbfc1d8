//! View change coordination.
//!
//! Drives primary replacement: building this node's view-change vote,
//! constructing a NewView once a quorum of votes is collected (when this node
//! is the incoming primary), and validating NewView messages from peers
//! before the new view is installed.
//!
//! The votes themselves live in the [`MessageLog`]; the coordinator only
//! tracks which view the current attempt targets.

use crate::message_log::MessageLog;
use pbft_types::{
    Hash, KeyPair, Membership, NewViewMessage, PrePrepareMessage, SequenceNumber,
    ViewChangeMessage, ViewNumber,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Why a NewView message was not accepted. Logged and dropped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NewViewError {
    #[error("view {view} is not later than current view {current}")]
    NotLater { view: ViewNumber, current: ViewNumber },
    #[error("signer is not the primary for view {0}")]
    WrongPrimary(ViewNumber),
    #[error("carries {got} valid view-change votes, quorum is {quorum}")]
    InsufficientVotes { got: u64, quorum: u64 },
    #[error("re-proposals do not match the prepared certificates in the vote quorum")]
    BadReProposals,
}

/// State of the current view-change attempt, if any.
pub struct ViewChangeCoordinator {
    /// The view the in-progress attempt targets. None in normal operation.
    target: Option<ViewNumber>,
}

impl ViewChangeCoordinator {
    pub fn new() -> Self {
        Self { target: None }
    }

    /// The view the current attempt targets.
    pub fn target(&self) -> Option<ViewNumber> {
        self.target
    }

    /// Start (or escalate to) an attempt targeting `view`.
    pub fn begin(&mut self, view: ViewNumber) {
        info!(target = view, "starting view change attempt");
        self.target = Some(view);
    }

    /// Clear the attempt after a view is installed or abandoned.
    pub fn reset(&mut self) {
        self.target = None;
    }

    /// Build this node's view-change vote for `target`.
    ///
    /// Carries the last finalized sequence and a certificate for every slot
    /// that prepared but did not commit, so the new primary can re-propose
    /// anything that may already have been finalized elsewhere.
    pub fn build_vote(
        target: ViewNumber,
        last_stable: SequenceNumber,
        log: &MessageLog,
        keypair: &KeyPair,
    ) -> ViewChangeMessage {
        ViewChangeMessage::new(target, last_stable, log.prepared_certificates(), keypair)
    }

    /// Construct the NewView for `target` from the collected vote quorum.
    ///
    /// Only meaningful on the node that is primary for `target`. Returns
    /// None if the log does not hold a quorum yet.
    pub fn build_new_view(
        target: ViewNumber,
        log: &MessageLog,
        membership: &Membership,
        keypair: &KeyPair,
    ) -> Option<NewViewMessage> {
        let votes = log.view_change_votes(target);
        if (votes.len() as u64) < membership.quorum() {
            return None;
        }

        let pre_prepares: Vec<PrePrepareMessage> = carry_forward(&votes)
            .into_iter()
            .map(|(sequence, digest)| PrePrepareMessage::new(target, sequence, digest, keypair))
            .collect();

        debug!(
            target,
            votes = votes.len(),
            re_proposals = pre_prepares.len(),
            "building new view"
        );
        Some(NewViewMessage::new(target, votes, pre_prepares, keypair))
    }

    /// Validate a NewView against the membership and current view.
    ///
    /// The outer signature was already checked when the message was recorded;
    /// this validates the claimed quorum and the carried re-proposals.
    pub fn validate_new_view(
        message: &NewViewMessage,
        membership: &Membership,
        current_view: ViewNumber,
    ) -> Result<(), NewViewError> {
        if message.view <= current_view {
            return Err(NewViewError::NotLater {
                view: message.view,
                current: current_view,
            });
        }
        if message.signer != membership.primary_for(message.view) {
            return Err(NewViewError::WrongPrimary(message.view));
        }

        // Count distinct member signers with valid votes for this view.
        let mut signers = std::collections::BTreeSet::new();
        for vote in &message.view_changes {
            if vote.new_view == message.view && membership.contains(&vote.signer) && vote.verify() {
                signers.insert(vote.signer);
            }
        }
        let quorum = membership.quorum();
        if (signers.len() as u64) < quorum {
            return Err(NewViewError::InsufficientVotes {
                got: signers.len() as u64,
                quorum,
            });
        }

        // The re-proposals must be exactly the carry-forward set implied by
        // the carried votes, each signed by the new primary for the new view.
        let expected = carry_forward(&message.view_changes);
        let mut actual = BTreeMap::new();
        for pp in &message.pre_prepares {
            if pp.view != message.view || pp.signer != message.signer || !pp.verify() {
                return Err(NewViewError::BadReProposals);
            }
            actual.insert(pp.sequence, pp.digest);
        }
        if actual != expected {
            return Err(NewViewError::BadReProposals);
        }
        Ok(())
    }
}

impl Default for ViewChangeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// The slots a new view must re-propose, derived from a set of view-change
/// votes: for every prepared certificate above the cutoff, the digest of the
/// highest-view certificate wins.
///
/// The cutoff is the LOWEST last-stable sequence claimed in the set. Claims
/// are unproven, and up to f of the votes can be Byzantine: an inflated
/// claim must never suppress a prepared certificate, while an understated
/// one only re-proposes slots that replicas past them already reject as
/// below their retention window.
fn carry_forward(votes: &[ViewChangeMessage]) -> BTreeMap<SequenceNumber, Hash> {
    let last_stable = votes
        .iter()
        .map(|vote| vote.last_stable_sequence)
        .min()
        .unwrap_or(0);

    let mut best: BTreeMap<SequenceNumber, (ViewNumber, Hash)> = BTreeMap::new();
    for vote in votes {
        for cert in &vote.prepared {
            if cert.sequence <= last_stable {
                continue;
            }
            match best.get(&cert.sequence) {
                Some(&(view, _)) if view >= cert.view => {}
                _ => {
                    best.insert(cert.sequence, (cert.view, cert.digest));
                }
            }
        }
    }
    best.into_iter()
        .map(|(sequence, (_, digest))| (sequence, digest))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::{ConsensusMessage, PreparedCertificate};
    use tracing_test::traced_test;

    fn keypairs(n: u8) -> Vec<KeyPair> {
        (0..n).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn membership_of(keys: &[KeyPair]) -> Membership {
        Membership::new(keys.iter().map(|k| k.public_key().into()).collect()).unwrap()
    }

    fn record_votes(
        log: &mut MessageLog,
        members: &Membership,
        votes: &[ViewChangeMessage],
    ) {
        for vote in votes {
            log.record(&ConsensusMessage::ViewChange(vote.clone()), members, 0);
        }
    }

    #[traced_test]
    #[test]
    fn test_new_view_requires_quorum() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let mut log = MessageLog::new(100);

        record_votes(
            &mut log,
            &members,
            &[
                ViewChangeMessage::new(1, 0, vec![], &keys[1]),
                ViewChangeMessage::new(1, 0, vec![], &keys[2]),
            ],
        );
        // Primary for view 1 is keys[1].
        assert!(ViewChangeCoordinator::build_new_view(1, &log, &members, &keys[1]).is_none());

        record_votes(
            &mut log,
            &members,
            &[ViewChangeMessage::new(1, 0, vec![], &keys[3])],
        );
        let new_view =
            ViewChangeCoordinator::build_new_view(1, &log, &members, &keys[1]).unwrap();
        assert_eq!(new_view.view, 1);
        assert!(new_view.pre_prepares.is_empty());
        assert!(ViewChangeCoordinator::validate_new_view(&new_view, &members, 0).is_ok());
    }

    #[traced_test]
    #[test]
    fn test_prepared_slot_is_carried_forward() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let mut log = MessageLog::new(100);
        let digest = Hash::of(b"block-3");
        let cert = PreparedCertificate {
            view: 0,
            sequence: 3,
            digest,
        };

        record_votes(
            &mut log,
            &members,
            &[
                ViewChangeMessage::new(1, 2, vec![cert], &keys[0]),
                ViewChangeMessage::new(1, 2, vec![], &keys[2]),
                ViewChangeMessage::new(1, 2, vec![], &keys[3]),
            ],
        );

        let new_view =
            ViewChangeCoordinator::build_new_view(1, &log, &members, &keys[1]).unwrap();
        assert_eq!(new_view.pre_prepares.len(), 1);
        assert_eq!(new_view.pre_prepares[0].sequence, 3);
        assert_eq!(new_view.pre_prepares[0].digest, digest);
        assert_eq!(new_view.pre_prepares[0].view, 1);
        assert!(ViewChangeCoordinator::validate_new_view(&new_view, &members, 0).is_ok());
    }

    #[traced_test]
    #[test]
    fn test_carry_forward_prefers_highest_view_and_skips_stable() {
        let keys = keypairs(4);
        let old = ViewChangeMessage::new(
            3,
            5,
            vec![
                PreparedCertificate {
                    view: 1,
                    sequence: 6,
                    digest: Hash::of(b"old"),
                },
                // At or below every sender's stable point; already final.
                PreparedCertificate {
                    view: 1,
                    sequence: 5,
                    digest: Hash::of(b"stable"),
                },
            ],
            &keys[0],
        );
        let newer = ViewChangeMessage::new(
            3,
            5,
            vec![PreparedCertificate {
                view: 2,
                sequence: 6,
                digest: Hash::of(b"new"),
            }],
            &keys[1],
        );

        let expected = carry_forward(&[old, newer]);
        assert_eq!(expected.len(), 1);
        assert_eq!(expected.get(&6), Some(&Hash::of(b"new")));
    }

    #[traced_test]
    #[test]
    fn test_inflated_last_stable_claim_cannot_drop_certificates() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let mut log = MessageLog::new(100);
        let digest = Hash::of(b"block-5");
        let cert = PreparedCertificate {
            view: 0,
            sequence: 5,
            digest,
        };

        // One sender claims a stable point far beyond anything finalized.
        // The honest prepared certificate must still be re-proposed.
        record_votes(
            &mut log,
            &members,
            &[
                ViewChangeMessage::new(1, 4, vec![cert], &keys[0]),
                ViewChangeMessage::new(1, 4, vec![cert], &keys[2]),
                ViewChangeMessage::new(1, 100, vec![], &keys[3]),
            ],
        );

        let new_view =
            ViewChangeCoordinator::build_new_view(1, &log, &members, &keys[1]).unwrap();
        assert_eq!(new_view.pre_prepares.len(), 1);
        assert_eq!(new_view.pre_prepares[0].sequence, 5);
        assert_eq!(new_view.pre_prepares[0].digest, digest);
        assert!(ViewChangeCoordinator::validate_new_view(&new_view, &members, 0).is_ok());

        // A NewView that drops the certificate behind the inflated claim is
        // rejected by every replica.
        let dropped = NewViewMessage::new(1, log.view_change_votes(1), vec![], &keys[1]);
        assert_eq!(
            ViewChangeCoordinator::validate_new_view(&dropped, &members, 0),
            Err(NewViewError::BadReProposals)
        );
    }

    #[traced_test]
    #[test]
    fn test_validate_rejects_wrong_primary() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let votes: Vec<ViewChangeMessage> = (0..3)
            .map(|i| ViewChangeMessage::new(1, 0, vec![], &keys[i]))
            .collect();

        // Signed by keys[2], but the primary for view 1 is keys[1].
        let forged = NewViewMessage::new(1, votes, vec![], &keys[2]);
        assert_eq!(
            ViewChangeCoordinator::validate_new_view(&forged, &members, 0),
            Err(NewViewError::WrongPrimary(1))
        );
    }

    #[traced_test]
    #[test]
    fn test_validate_rejects_vote_padding() {
        let keys = keypairs(4);
        let members = membership_of(&keys);

        // Three copies of the same vote are one distinct signer.
        let vote = ViewChangeMessage::new(1, 0, vec![], &keys[2]);
        let padded = NewViewMessage::new(1, vec![vote.clone(), vote.clone(), vote], vec![], &keys[1]);
        assert_eq!(
            ViewChangeCoordinator::validate_new_view(&padded, &members, 0),
            Err(NewViewError::InsufficientVotes { got: 1, quorum: 3 })
        );
    }

    #[traced_test]
    #[test]
    fn test_validate_rejects_dropped_re_proposal() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let cert = PreparedCertificate {
            view: 0,
            sequence: 1,
            digest: Hash::of(b"block-1"),
        };
        let votes = vec![
            ViewChangeMessage::new(1, 0, vec![cert], &keys[0]),
            ViewChangeMessage::new(1, 0, vec![], &keys[2]),
            ViewChangeMessage::new(1, 0, vec![], &keys[3]),
        ];

        // A quorum member prepared sequence 1, but the primary carries no
        // re-proposal for it.
        let dropped = NewViewMessage::new(1, votes, vec![], &keys[1]);
        assert_eq!(
            ViewChangeCoordinator::validate_new_view(&dropped, &members, 0),
            Err(NewViewError::BadReProposals)
        );
    }

    #[traced_test]
    #[test]
    fn test_validate_rejects_stale_view() {
        let keys = keypairs(4);
        let members = membership_of(&keys);
        let votes: Vec<ViewChangeMessage> = [0usize, 2, 3]
            .iter()
            .map(|&i| ViewChangeMessage::new(1, 0, vec![], &keys[i]))
            .collect();
        let new_view = NewViewMessage::new(1, votes, vec![], &keys[1]);

        assert_eq!(
            ViewChangeCoordinator::validate_new_view(&new_view, &members, 1),
            Err(NewViewError::NotLater { view: 1, current: 1 })
        );
    }
}
