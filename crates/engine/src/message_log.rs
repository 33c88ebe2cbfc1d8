//! Deduplicating message log with quorum counting.
//!
//! The log owns every consensus message and phase record the node has
//! accepted. The phase engine and view change coordinator only query it and
//! append to it; the single mutation they perform on stored data is advancing
//! a slot's phase status.
//!
//! Vote counting is by distinct signer per (kind, view, sequence, digest), so
//! replays and rebroadcasts never inflate a count.

use pbft_types::{
    ConsensusMessage, DedupKey, Hash, Membership, MessageKind, PeerId, PreparedCertificate,
    SequenceNumber, ViewChangeMessage, ViewNumber,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Why a message was rejected. Evidence of faulty peers, not local errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("sender {0} is not a member")]
    NotAMember(PeerId),
    #[error("invalid signature from {0}")]
    InvalidSignature(PeerId),
    #[error("view {view} is stale, current view is {current}")]
    StaleView { view: ViewNumber, current: ViewNumber },
    #[error("sequence {sequence} outside retention window ({low}, {high}]")]
    SequenceOutOfWindow {
        sequence: SequenceNumber,
        low: SequenceNumber,
        high: SequenceNumber,
    },
}

/// Result of recording a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New message, indexed and counted.
    Accepted,
    /// Same dedup key already present. Not an error.
    DuplicateIgnored,
    /// Classified protocol violation; contributed no state change.
    Rejected(RejectReason),
}

/// Phase status of one (view, sequence) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// A proposal was accepted for this slot.
    PrePrepared,
    /// A prepare quorum was observed for the proposal.
    Prepared,
    /// A commit quorum was observed; the slot is finalized. Terminal.
    Committed,
}

/// Per-slot record: the accepted digest and how far the slot has advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub digest: Hash,
}

/// The message log.
pub struct MessageLog {
    /// How far ahead of the last finalized sequence a message may be.
    max_log_size: u64,

    /// Last finalized sequence. Everything at or below it is pruned.
    low_water_mark: SequenceNumber,

    /// Dedup keys of every accepted message.
    seen: HashSet<DedupKey>,

    /// Distinct signers per (kind, view, sequence, digest).
    vote_index: HashMap<(MessageKind, ViewNumber, SequenceNumber, Hash), BTreeSet<PeerId>>,

    /// Accepted view-change votes by target view, keyed by signer. Kept in
    /// full so the new primary can embed the quorum in its NewView.
    view_changes: BTreeMap<ViewNumber, BTreeMap<PeerId, ViewChangeMessage>>,

    /// Phase status per (view, sequence) slot.
    phases: BTreeMap<(ViewNumber, SequenceNumber), PhaseRecord>,
}

impl MessageLog {
    pub fn new(max_log_size: u64) -> Self {
        Self {
            max_log_size,
            low_water_mark: 0,
            seen: HashSet::new(),
            vote_index: HashMap::new(),
            view_changes: BTreeMap::new(),
            phases: BTreeMap::new(),
        }
    }

    /// Number of accepted messages currently retained.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Last finalized sequence number.
    pub fn low_water_mark(&self) -> SequenceNumber {
        self.low_water_mark
    }

    pub fn set_max_log_size(&mut self, size: u64) {
        self.max_log_size = size;
    }

    /// Record a message: verify, classify, dedup, index.
    pub fn record(
        &mut self,
        message: &ConsensusMessage,
        membership: &Membership,
        current_view: ViewNumber,
    ) -> RecordOutcome {
        let signer = message.signer();
        if !membership.contains(&signer) {
            return RecordOutcome::Rejected(RejectReason::NotAMember(signer));
        }

        if let Some(reason) = self.window_violation(message, current_view) {
            return RecordOutcome::Rejected(reason);
        }

        let key = message.dedup_key();
        if self.seen.contains(&key) {
            return RecordOutcome::DuplicateIgnored;
        }

        // Signature check last: duplicates and out-of-window input are
        // filtered before paying for verification.
        if !message.verify() {
            return RecordOutcome::Rejected(RejectReason::InvalidSignature(signer));
        }

        self.seen.insert(key);
        match message {
            ConsensusMessage::PrePrepare(m) => {
                self.index_vote(MessageKind::PrePrepare, m.view, m.sequence, m.digest, signer);
            }
            ConsensusMessage::Prepare(m) => {
                self.index_vote(MessageKind::Prepare, m.view, m.sequence, m.digest, signer);
            }
            ConsensusMessage::Commit(m) => {
                self.index_vote(MessageKind::Commit, m.view, m.sequence, m.digest, signer);
            }
            ConsensusMessage::ViewChange(m) => {
                self.view_changes
                    .entry(m.new_view)
                    .or_default()
                    .insert(signer, m.clone());
            }
            // NewView is not a vote; the coordinator validates its contents.
            ConsensusMessage::NewView(_) => {}
        }
        RecordOutcome::Accepted
    }

    fn window_violation(
        &self,
        message: &ConsensusMessage,
        current_view: ViewNumber,
    ) -> Option<RejectReason> {
        match message.kind() {
            MessageKind::PrePrepare | MessageKind::Prepare | MessageKind::Commit => {
                let view = message.view();
                if view < current_view {
                    return Some(RejectReason::StaleView {
                        view,
                        current: current_view,
                    });
                }
                let sequence = message.sequence();
                let low = self.low_water_mark;
                let high = low + self.max_log_size;
                if sequence <= low || sequence > high {
                    return Some(RejectReason::SequenceOutOfWindow {
                        sequence,
                        low,
                        high,
                    });
                }
                None
            }
            // View-change traffic targets a later view by definition and is
            // not tied to one slot, so no sequence window applies.
            MessageKind::ViewChange | MessageKind::NewView => {
                let view = message.view();
                if view <= current_view {
                    Some(RejectReason::StaleView {
                        view,
                        current: current_view,
                    })
                } else {
                    None
                }
            }
        }
    }

    fn index_vote(
        &mut self,
        kind: MessageKind,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        signer: PeerId,
    ) {
        self.vote_index
            .entry((kind, view, sequence, digest))
            .or_default()
            .insert(signer);
    }

    /// Number of distinct senders for one (kind, view, sequence, digest).
    pub fn count_votes(
        &self,
        kind: MessageKind,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
    ) -> u64 {
        self.vote_index
            .get(&(kind, view, sequence, digest))
            .map_or(0, |signers| signers.len() as u64)
    }

    /// Distinct senders counting toward the prepare quorum.
    ///
    /// The primary never sends a Prepare; its PrePrepare is the implicit
    /// first match, so the count is the union of PrePrepare and Prepare
    /// signers for the digest.
    pub fn prepare_vote_count(
        &self,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
    ) -> u64 {
        let pre_prepares = self
            .vote_index
            .get(&(MessageKind::PrePrepare, view, sequence, digest));
        let prepares = self
            .vote_index
            .get(&(MessageKind::Prepare, view, sequence, digest));
        match (pre_prepares, prepares) {
            (Some(a), Some(b)) => a.union(b).count() as u64,
            (Some(a), None) => a.len() as u64,
            (None, Some(b)) => b.len() as u64,
            (None, None) => 0,
        }
    }

    /// Whether 2f+1 distinct senders back the prepare phase for a digest.
    pub fn prepare_quorum_reached(
        &self,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        membership: &Membership,
    ) -> bool {
        self.prepare_vote_count(view, sequence, digest) >= membership.quorum()
    }

    /// Whether 2f+1 distinct senders (own vote included) committed a digest.
    pub fn commit_quorum_reached(
        &self,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        membership: &Membership,
    ) -> bool {
        self.count_votes(MessageKind::Commit, view, sequence, digest) >= membership.quorum()
    }

    /// Number of distinct senders voting to move to `target` view.
    ///
    /// Unlike phase votes, view-change votes for the same target count
    /// together regardless of the prepared sets they carry.
    pub fn view_change_count(&self, target: ViewNumber) -> u64 {
        self.view_changes
            .get(&target)
            .map_or(0, |votes| votes.len() as u64)
    }

    /// Whether 2f+1 distinct senders voted to move to `target` view.
    pub fn view_change_quorum_reached(&self, target: ViewNumber, membership: &Membership) -> bool {
        self.view_change_count(target) >= membership.quorum()
    }

    /// The collected view-change votes for a target view.
    pub fn view_change_votes(&self, target: ViewNumber) -> Vec<ViewChangeMessage> {
        self.view_changes
            .get(&target)
            .map_or_else(Vec::new, |votes| votes.values().cloned().collect())
    }

    /// Phase record for a slot, if one exists.
    pub fn phase(&self, view: ViewNumber, sequence: SequenceNumber) -> Option<PhaseRecord> {
        self.phases.get(&(view, sequence)).copied()
    }

    /// Create a slot record at PrePrepared. No-op if the slot exists.
    pub fn begin_slot(&mut self, view: ViewNumber, sequence: SequenceNumber, digest: Hash) {
        self.phases.entry((view, sequence)).or_insert(PhaseRecord {
            phase: Phase::PrePrepared,
            digest,
        });
    }

    /// Advance a slot's phase. Phases only move forward; a stale advance is
    /// ignored.
    pub fn advance_phase(&mut self, view: ViewNumber, sequence: SequenceNumber, phase: Phase) {
        if let Some(record) = self.phases.get_mut(&(view, sequence)) {
            if phase > record.phase {
                record.phase = phase;
            }
        }
    }

    /// Certificates for slots that prepared but have not committed. These are
    /// the slots a view change must carry forward.
    pub fn prepared_certificates(&self) -> Vec<PreparedCertificate> {
        self.phases
            .iter()
            .filter(|(_, record)| record.phase == Phase::Prepared)
            .map(|(&(view, sequence), record)| PreparedCertificate {
                view,
                sequence,
                digest: record.digest,
            })
            .collect()
    }

    /// Advance the low-water mark after finalizing `sequence` and prune
    /// everything at or below it. Records for in-flight slots above the mark
    /// are never discarded.
    pub fn finalize(&mut self, sequence: SequenceNumber) {
        self.low_water_mark = self.low_water_mark.max(sequence);
        let mark = self.low_water_mark;

        self.seen.retain(|key| match key.kind {
            MessageKind::PrePrepare | MessageKind::Prepare | MessageKind::Commit => {
                key.sequence > mark
            }
            MessageKind::ViewChange | MessageKind::NewView => true,
        });
        self.vote_index
            .retain(|&(_, _, sequence, _), _| sequence > mark);
        self.phases.retain(|&(_, sequence), _| sequence > mark);

        debug!(
            low_water_mark = mark,
            retained = self.seen.len(),
            "pruned finalized log entries"
        );
    }

    /// Drop view-change traffic for views at or below the installed view.
    pub fn prune_view_changes(&mut self, installed: ViewNumber) {
        self.view_changes.retain(|&target, _| target > installed);
        self.seen.retain(|key| match key.kind {
            MessageKind::ViewChange | MessageKind::NewView => key.view > installed,
            _ => true,
        });
    }
}
