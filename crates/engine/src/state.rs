//! The PBFT consensus state machine.
//!
//! [`PbftState`] is the single owned aggregate holding the view, the message
//! log, and the view-change coordinator. It implements [`StateMachine`]:
//! every inbound message, timer expiry, and ledger callback arrives as one
//! [`Event`] on a serialized stream, and every side effect leaves as an
//! [`Action`]. No I/O happens here.
//!
//! Phase progression per slot is Idle → PrePrepared → Prepared → Committed,
//! gated on the slot's current phase so votes are never counted out of
//! order. Invalid input is classified and dropped, never fatal.

use crate::config::PbftConfig;
use crate::message_log::{MessageLog, Phase, RecordOutcome};
use crate::view_change::ViewChangeCoordinator;
use crate::view_state::{Mode, ViewState};
use pbft_core::{Action, Event, StateMachine, TimerId};
use pbft_types::{
    BlockCandidate, CommitMessage, ConsensusMessage, Hash, KeyPair, Membership, NewViewMessage,
    PeerId, PrePrepareMessage, PrepareMessage, SequenceNumber, ViewChangeMessage, ViewNumber,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The consensus state machine for one validator.
pub struct PbftState {
    config: PbftConfig,
    keypair: KeyPair,
    local_id: PeerId,
    membership: Membership,
    view: ViewState,
    log: MessageLog,
    coordinator: ViewChangeCoordinator,

    /// Highest finalized sequence number. The next proposal is one above.
    last_finalized: SequenceNumber,

    /// Whether a candidate request to the ledger is outstanding.
    candidate_requested: bool,
}

impl PbftState {
    pub fn new(config: PbftConfig, keypair: KeyPair) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let membership = config.membership()?;
        let local_id: PeerId = keypair.public_key().into();
        let log = MessageLog::new(config.max_log_size);
        Ok(Self {
            config,
            keypair,
            local_id,
            membership,
            view: ViewState::new(),
            log,
            coordinator: ViewChangeCoordinator::new(),
            last_finalized: 0,
            candidate_requested: false,
        })
    }

    /// Initial actions when the node comes up: arm the progress timers and,
    /// if this node is the first primary, ask for a candidate.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = vec![
            Action::SetTimer {
                id: TimerId::Idle,
                duration: self.config.idle_timeout,
            },
            Action::SetTimer {
                id: TimerId::Commit,
                duration: self.config.commit_timeout,
            },
        ];
        if self.is_local_primary() {
            self.request_candidate(&mut actions);
        }
        actions
    }

    pub fn current_view(&self) -> ViewNumber {
        self.view.current_view()
    }

    pub fn mode(&self) -> Mode {
        self.view.mode()
    }

    pub fn last_finalized(&self) -> SequenceNumber {
        self.last_finalized
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    fn next_sequence(&self) -> SequenceNumber {
        self.last_finalized + 1
    }

    fn is_local_primary(&self) -> bool {
        self.view.is_primary(&self.membership, &self.local_id)
    }

    /// Rebuild in-flight state from persisted messages after a restart.
    ///
    /// Broadcast and persistence effects are suppressed: peers already saw
    /// our votes and the store already holds them. Finalization actions are
    /// kept, because a crash may have landed between reaching a commit
    /// quorum and handing the block to the ledger; ledger finalization is
    /// idempotent.
    pub fn restore(&mut self, messages: Vec<ConsensusMessage>) -> Vec<Action> {
        info!(count = messages.len(), "restoring from persisted log");
        let mut finalizations = Vec::new();
        for message in messages {
            let event = match message {
                ConsensusMessage::PrePrepare(m) => Event::PrePrepareReceived { message: m },
                ConsensusMessage::Prepare(m) => Event::PrepareReceived { message: m },
                ConsensusMessage::Commit(m) => Event::CommitReceived { message: m },
                ConsensusMessage::ViewChange(m) => Event::ViewChangeReceived { message: m },
                ConsensusMessage::NewView(m) => Event::NewViewReceived { message: m },
            };
            for action in self.handle(event) {
                if matches!(action, Action::FinalizeBlock { .. }) {
                    finalizations.push(action);
                }
            }
        }
        finalizations
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Record an inbound message; returns false for duplicates and rejects.
    ///
    /// Every accepted message is persisted, not just our own: restore
    /// replays the full accepted set, so the rebuilt log matches what this
    /// node already acted on and a restart cannot re-vote differently.
    fn record(&mut self, message: &ConsensusMessage, actions: &mut Vec<Action>) -> bool {
        match self
            .log
            .record(message, &self.membership, self.view.current_view())
        {
            RecordOutcome::Accepted => {
                actions.push(Action::PersistMessage {
                    message: message.clone(),
                });
                true
            }
            RecordOutcome::DuplicateIgnored => {
                debug!(kind = message.type_name(), "duplicate message ignored");
                false
            }
            RecordOutcome::Rejected(reason) => {
                warn!(
                    kind = message.type_name(),
                    signer = %message.signer(),
                    %reason,
                    "rejected message"
                );
                false
            }
        }
    }

    /// Record our own message, persist it, and queue the broadcast.
    ///
    /// Recording before broadcasting makes own votes count identically to
    /// peer votes without a network loopback.
    fn broadcast_own(&mut self, message: ConsensusMessage, actions: &mut Vec<Action>) {
        self.log
            .record(&message, &self.membership, self.view.current_view());
        actions.push(Action::PersistMessage {
            message: message.clone(),
        });
        actions.push(Action::Broadcast { message });
    }

    fn request_candidate(&mut self, actions: &mut Vec<Action>) {
        if self.candidate_requested {
            return;
        }
        self.candidate_requested = true;
        actions.push(Action::RequestBlockCandidate {
            sequence: self.next_sequence(),
        });
    }

    fn reset_idle_timer(&self, actions: &mut Vec<Action>) {
        actions.push(Action::SetTimer {
            id: TimerId::Idle,
            duration: self.config.idle_timeout,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal operation
    // ═══════════════════════════════════════════════════════════════════════

    fn on_block_candidate(&mut self, candidate: BlockCandidate) -> Vec<Action> {
        self.candidate_requested = false;

        if self.view.mode() != Mode::Normal {
            debug!("dropping block candidate while view-changing");
            return vec![];
        }
        if !self.is_local_primary() {
            debug!("dropping block candidate, not the primary");
            return vec![];
        }
        if candidate.sequence != self.next_sequence() {
            warn!(
                sequence = candidate.sequence,
                expected = self.next_sequence(),
                "dropping block candidate at unexpected sequence"
            );
            return vec![];
        }
        let view = self.view.current_view();
        if self.log.phase(view, candidate.sequence).is_some() {
            debug!(
                sequence = candidate.sequence,
                "already proposing at this sequence"
            );
            return vec![];
        }

        info!(
            view,
            sequence = candidate.sequence,
            digest = %candidate.digest,
            "proposing block"
        );

        let mut actions = vec![];
        // The primary's PrePrepare is the implicit first prepare match.
        self.log.begin_slot(view, candidate.sequence, candidate.digest);
        let message = PrePrepareMessage::new(view, candidate.sequence, candidate.digest, &self.keypair);
        self.broadcast_own(ConsensusMessage::PrePrepare(message), &mut actions);
        self.reset_idle_timer(&mut actions);
        actions
    }

    fn on_pre_prepare(&mut self, message: PrePrepareMessage) -> Vec<Action> {
        let mut actions = vec![];
        let as_consensus = ConsensusMessage::PrePrepare(message.clone());
        if !self.record(&as_consensus, &mut actions) {
            return actions;
        }
        if self.view.mode() != Mode::Normal {
            debug!("ignoring pre-prepare while view-changing");
            return actions;
        }
        let view = self.view.current_view();
        if message.view != view {
            debug!(
                message_view = message.view,
                current_view = view,
                "pre-prepare for a different view, held in log"
            );
            return actions;
        }
        if !self.view.is_primary(&self.membership, &message.signer) {
            warn!(signer = %message.signer, "pre-prepare from non-primary");
            return actions;
        }
        if message.sequence != self.next_sequence() {
            debug!(
                sequence = message.sequence,
                expected = self.next_sequence(),
                "pre-prepare at unexpected sequence"
            );
            return actions;
        }

        match self.log.phase(view, message.sequence) {
            Some(record) if record.digest != message.digest => {
                // Same slot, different digest: the primary equivocated.
                warn!(
                    sequence = message.sequence,
                    accepted = %record.digest,
                    conflicting = %message.digest,
                    "conflicting pre-prepare rejected"
                );
                return actions;
            }
            Some(_) => {
                // Slot already open with this digest (e.g. re-seeded from a
                // NewView); just re-check quorum below.
            }
            None => {
                self.log.begin_slot(view, message.sequence, message.digest);
                self.reset_idle_timer(&mut actions);
                if message.signer != self.local_id {
                    let prepare =
                        PrepareMessage::new(view, message.sequence, message.digest, &self.keypair);
                    self.broadcast_own(ConsensusMessage::Prepare(prepare), &mut actions);
                }
            }
        }

        self.check_prepare_quorum(view, message.sequence, message.digest, &mut actions);
        actions
    }

    fn on_prepare(&mut self, message: PrepareMessage) -> Vec<Action> {
        let mut actions = vec![];
        if !self.record(&ConsensusMessage::Prepare(message.clone()), &mut actions) {
            return actions;
        }
        if message.view != self.view.current_view() {
            return actions;
        }
        self.check_prepare_quorum(message.view, message.sequence, message.digest, &mut actions);
        actions
    }

    fn on_commit(&mut self, message: CommitMessage) -> Vec<Action> {
        let mut actions = vec![];
        if !self.record(&ConsensusMessage::Commit(message.clone()), &mut actions) {
            return actions;
        }
        if message.view != self.view.current_view() {
            return actions;
        }
        self.check_commit_quorum(message.view, message.sequence, message.digest, &mut actions);
        actions
    }

    /// Advance PrePrepared → Prepared once 2f+1 matching prepare-phase votes
    /// are in the log, then broadcast our commit vote.
    fn check_prepare_quorum(
        &mut self,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        actions: &mut Vec<Action>,
    ) {
        let Some(record) = self.log.phase(view, sequence) else {
            return;
        };
        if record.phase != Phase::PrePrepared || record.digest != digest {
            return;
        }
        if !self
            .log
            .prepare_quorum_reached(view, sequence, digest, &self.membership)
        {
            return;
        }

        info!(view, sequence, %digest, "prepared");
        self.log.advance_phase(view, sequence, Phase::Prepared);
        let commit = CommitMessage::new(view, sequence, digest, &self.keypair);
        self.broadcast_own(ConsensusMessage::Commit(commit), actions);
        self.check_commit_quorum(view, sequence, digest, actions);
    }

    /// Advance Prepared → Committed once 2f+1 commit votes (own included)
    /// are in the log, then finalize.
    fn check_commit_quorum(
        &mut self,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        actions: &mut Vec<Action>,
    ) {
        let Some(record) = self.log.phase(view, sequence) else {
            return;
        };
        if record.phase != Phase::Prepared || record.digest != digest {
            return;
        }
        if !self
            .log
            .commit_quorum_reached(view, sequence, digest, &self.membership)
        {
            return;
        }

        info!(view, sequence, %digest, "committed, finalizing block");
        self.log.advance_phase(view, sequence, Phase::Committed);
        self.last_finalized = sequence;
        self.log.finalize(sequence);
        self.candidate_requested = false;

        actions.push(Action::FinalizeBlock { sequence, digest });
        actions.push(Action::CompactLog { up_to: sequence });
        actions.push(Action::SetTimer {
            id: TimerId::Idle,
            duration: self.config.idle_timeout,
        });
        actions.push(Action::SetTimer {
            id: TimerId::Commit,
            duration: self.config.commit_timeout,
        });

        // Bounded primary tenure: rotate the view on a fixed block cadence
        // even without faults.
        let period = self.config.forced_view_change_period;
        if period > 0 && sequence % period == 0 {
            info!(sequence, period, "forced view change");
            self.trigger_view_change(self.view.current_view() + 1, actions);
            return;
        }

        if self.is_local_primary() {
            self.request_candidate(actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View changes
    // ═══════════════════════════════════════════════════════════════════════

    fn on_progress_timeout(&mut self, timer: &'static str) -> Vec<Action> {
        if self.view.mode() == Mode::ViewChanging {
            debug!(timer, "progress timeout while already view-changing");
            return vec![];
        }
        info!(
            timer,
            view = self.view.current_view(),
            "no progress, triggering view change"
        );
        let mut actions = vec![];
        self.trigger_view_change(self.view.current_view() + 1, &mut actions);
        actions
    }

    fn on_view_change_timeout(&mut self) -> Vec<Action> {
        if self.view.mode() != Mode::ViewChanging {
            debug!("stale view-change timer fire");
            return vec![];
        }
        let escalated = self
            .coordinator
            .target()
            .unwrap_or(self.view.current_view())
            + 1;
        warn!(
            target = escalated,
            "view change stalled, escalating to next view"
        );
        let mut actions = vec![];
        self.trigger_view_change(escalated, &mut actions);
        actions
    }

    /// Enter (or escalate) a view change targeting `target`: broadcast our
    /// vote with prepared certificates, stop the progress timers, and arm
    /// the escalation timer.
    fn trigger_view_change(&mut self, target: ViewNumber, actions: &mut Vec<Action>) {
        self.view.enter_view_changing();
        self.coordinator.begin(target);
        self.candidate_requested = false;

        let vote = ViewChangeCoordinator::build_vote(
            target,
            self.last_finalized,
            &self.log,
            &self.keypair,
        );
        self.broadcast_own(ConsensusMessage::ViewChange(vote), actions);

        actions.push(Action::CancelTimer { id: TimerId::Idle });
        actions.push(Action::CancelTimer {
            id: TimerId::Commit,
        });
        actions.push(Action::SetTimer {
            id: TimerId::ViewChange,
            duration: self.config.view_change_duration,
        });

        self.maybe_complete_view_change(target, actions);
    }

    fn on_view_change(&mut self, message: ViewChangeMessage) -> Vec<Action> {
        let target = message.new_view;
        let mut actions = vec![];
        if !self.record(&ConsensusMessage::ViewChange(message), &mut actions) {
            return actions;
        }

        if target <= self.view.current_view() {
            return actions;
        }
        if !self.log.view_change_quorum_reached(target, &self.membership) {
            return actions;
        }

        // A quorum of peers is abandoning the current view; follow them
        // even if our own timers have not fired.
        if self.coordinator.target() != Some(target) {
            info!(target, "view-change quorum observed, joining");
            self.trigger_view_change(target, &mut actions);
        } else {
            self.maybe_complete_view_change(target, &mut actions);
        }
        actions
    }

    /// If this node is the primary for `target` and holds a vote quorum,
    /// build and broadcast the NewView and install it locally.
    fn maybe_complete_view_change(&mut self, target: ViewNumber, actions: &mut Vec<Action>) {
        if self.membership.primary_for(target) != self.local_id {
            return;
        }
        let Some(new_view) = ViewChangeCoordinator::build_new_view(
            target,
            &self.log,
            &self.membership,
            &self.keypair,
        ) else {
            return;
        };

        info!(view = target, "assuming primary role, broadcasting new view");
        self.broadcast_own(ConsensusMessage::NewView(new_view.clone()), actions);
        self.install_new_view(new_view, actions);
    }

    fn on_new_view(&mut self, message: NewViewMessage) -> Vec<Action> {
        let mut actions = vec![];
        if !self.record(&ConsensusMessage::NewView(message.clone()), &mut actions) {
            return actions;
        }
        if let Err(reason) = ViewChangeCoordinator::validate_new_view(
            &message,
            &self.membership,
            self.view.current_view(),
        ) {
            warn!(view = message.view, %reason, "rejecting new view");
            return actions;
        }
        self.install_new_view(message, &mut actions);
        actions
    }

    /// Install a validated new view: exit view-changing mode, restart the
    /// progress timers, and re-seed carried-forward proposals.
    fn install_new_view(&mut self, message: NewViewMessage, actions: &mut Vec<Action>) {
        let view = message.view;
        if let Err(reason) = self.view.exit_view_changing(view) {
            warn!(%reason, "cannot install new view");
            return;
        }
        info!(
            view,
            primary = %self.membership.primary_for(view),
            carried = message.pre_prepares.len(),
            "installed new view"
        );

        self.coordinator.reset();
        self.log.prune_view_changes(view);
        self.candidate_requested = false;

        actions.push(Action::CancelTimer {
            id: TimerId::ViewChange,
        });
        self.reset_idle_timer(actions);
        actions.push(Action::SetTimer {
            id: TimerId::Commit,
            duration: self.config.commit_timeout,
        });

        // Re-proposals flow through the normal pre-prepare path as internal
        // events, so prepared work survives the view change unaltered.
        for pre_prepare in message.pre_prepares {
            actions.push(Action::EnqueueInternal {
                event: Event::PrePrepareReceived {
                    message: pre_prepare,
                },
            });
        }

        if self.is_local_primary() {
            self.request_candidate(actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings
    // ═══════════════════════════════════════════════════════════════════════

    fn on_settings_updated(&mut self, settings: HashMap<String, String>) -> Vec<Action> {
        let mut merged = self.config.clone();
        if let Err(reason) = merged.merge_settings(&settings) {
            warn!(%reason, "ignoring invalid settings update");
            return vec![];
        }

        if merged.members != self.config.members {
            match merged.membership() {
                Ok(membership) => {
                    info!(members = membership.len(), "membership updated");
                    self.membership = membership;
                }
                Err(reason) => {
                    warn!(%reason, "ignoring settings update with unusable members");
                    return vec![];
                }
            }
        }
        self.log.set_max_log_size(merged.max_log_size);
        self.config = merged;
        vec![]
    }
}

impl StateMachine for PbftState {
    /// Phase progression is event-driven and deadlines live in the runner's
    /// timers, so the engine has no use for the clock.
    fn set_time(&mut self, _now: Duration) {}

    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::IdleTimeout => self.on_progress_timeout("idle"),
            Event::CommitTimeout => self.on_progress_timeout("commit"),
            Event::ViewChangeTimeout => self.on_view_change_timeout(),
            Event::PrePrepareReceived { message } => self.on_pre_prepare(message),
            Event::PrepareReceived { message } => self.on_prepare(message),
            Event::CommitReceived { message } => self.on_commit(message),
            Event::ViewChangeReceived { message } => self.on_view_change(message),
            Event::NewViewReceived { message } => self.on_new_view(message),
            Event::BlockCandidateReady { candidate } => self.on_block_candidate(candidate),
            Event::SettingsUpdated { settings } => self.on_settings_updated(settings),
        }
    }
}
