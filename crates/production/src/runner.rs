//! Production event loop.
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events through an mpsc channel, so the state machine itself
//! never needs a lock. Network and ledger I/O live behind the
//! [`ConsensusService`] trait; the loop executes actions synchronously in
//! the order the state machine emitted them.

use crate::storage::{LogStore, StorageError};
use crate::timers::{timer_event, Timers};
use pbft_core::{Action, Event, StateMachine};
use pbft_engine::PbftState;
use pbft_types::{BlockCandidate, ConsensusMessage, Hash, SequenceNumber};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, trace};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The runner's window onto the outside world: gossip transport plus the
/// ledger that produces candidates and accepts finalized blocks.
pub trait ConsensusService: Send {
    /// Send a message to every other member. Own messages are already
    /// recorded by the state machine; do not loop them back.
    fn broadcast(&mut self, message: ConsensusMessage);

    /// Ask the ledger to assemble a candidate for `sequence`. The answer
    /// comes back through [`RunnerHandle::block_candidate`] after the
    /// configured publishing delay.
    fn request_block_candidate(&mut self, sequence: SequenceNumber);

    /// Hand a committed block to the ledger. Must be idempotent per
    /// sequence number; restarts may replay the last finalization.
    fn finalize_block(&mut self, sequence: SequenceNumber, digest: Hash);
}

/// Cloneable handle for feeding events into a running [`ProductionRunner`].
#[derive(Clone)]
pub struct RunnerHandle {
    event_tx: mpsc::Sender<Event>,
}

impl RunnerHandle {
    /// Deliver a consensus message received from a peer.
    pub async fn deliver(&self, message: ConsensusMessage) -> Result<(), RunnerError> {
        self.submit(message_event(message)).await
    }

    /// Answer an earlier candidate request from the ledger.
    pub async fn block_candidate(&self, candidate: BlockCandidate) -> Result<(), RunnerError> {
        self.submit(Event::BlockCandidateReady { candidate }).await
    }

    /// Apply an on-chain settings update.
    pub async fn settings_updated(
        &self,
        settings: HashMap<String, String>,
    ) -> Result<(), RunnerError> {
        self.submit(Event::SettingsUpdated { settings }).await
    }

    pub async fn submit(&self, event: Event) -> Result<(), RunnerError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }
}

fn message_event(message: ConsensusMessage) -> Event {
    match message {
        ConsensusMessage::PrePrepare(m) => Event::PrePrepareReceived { message: m },
        ConsensusMessage::Prepare(m) => Event::PrepareReceived { message: m },
        ConsensusMessage::Commit(m) => Event::CommitReceived { message: m },
        ConsensusMessage::ViewChange(m) => Event::ViewChangeReceived { message: m },
        ConsensusMessage::NewView(m) => Event::NewViewReceived { message: m },
    }
}

/// Handle for shutting down a running [`ProductionRunner`]. Dropping it
/// also triggers shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Owns the state machine and drives it from a serialized event stream.
pub struct ProductionRunner<S: ConsensusService> {
    state: PbftState,
    service: S,
    store: Box<dyn LogStore>,
    timers: Timers,
    event_rx: mpsc::Receiver<Event>,
    internal: VecDeque<Event>,
    started: Instant,
}

impl<S: ConsensusService> ProductionRunner<S> {
    pub fn new(
        state: PbftState,
        service: S,
        store: Box<dyn LogStore>,
        channel_capacity: usize,
    ) -> (Self, RunnerHandle) {
        let (event_tx, event_rx) = mpsc::channel(channel_capacity);
        let runner = Self {
            state,
            service,
            store,
            timers: Timers::new(),
            event_rx,
            internal: VecDeque::new(),
            started: Instant::now(),
        };
        (runner, RunnerHandle { event_tx })
    }

    /// Restore persisted state, emit startup actions, then loop until the
    /// shutdown signal fires or every handle is dropped.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), RunnerError> {
        let persisted = self.store.load()?;
        if !persisted.is_empty() {
            let actions = self.state.restore(persisted);
            self.execute_all(actions)?;
        }
        let actions = self.state.start();
        self.execute_all(actions)?;
        info!(
            local_id = %self.state.local_id(),
            view = self.state.current_view(),
            "consensus runner started"
        );

        loop {
            // Internal events preserve causality: drain them before
            // touching the channel or the clock.
            while let Some(event) = self.internal.pop_front() {
                self.dispatch(event)?;
            }

            let deadline = self.timers.next_deadline();
            tokio::select! {
                _ = &mut shutdown => {
                    info!("consensus runner shutting down");
                    break;
                }
                maybe_event = self.event_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.dispatch(event)?,
                        None => break,
                    }
                }
                _ = sleep_until(deadline) => {
                    for id in self.timers.poll(Instant::now()) {
                        self.dispatch(timer_event(id))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<(), RunnerError> {
        trace!(event = event.type_name(), "dispatching");
        self.state.set_time(self.started.elapsed());
        let actions = self.state.handle(event);
        self.execute_all(actions)
    }

    fn execute_all(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        for action in actions {
            self.execute(action)?;
        }
        Ok(())
    }

    fn execute(&mut self, action: Action) -> Result<(), RunnerError> {
        trace!(action = action.type_name(), "executing");
        match action {
            // Persistence is ordered before Broadcast in the state
            // machine's output, so a vote is durable before peers see it.
            Action::PersistMessage { message } => self.store.append(&message)?,
            Action::Broadcast { message } => self.service.broadcast(message),
            Action::SetTimer { id, duration } => self.timers.start(id, duration),
            Action::CancelTimer { id } => self.timers.cancel(id),
            Action::EnqueueInternal { event } => self.internal.push_back(event),
            Action::RequestBlockCandidate { sequence } => {
                self.service.request_block_candidate(sequence)
            }
            Action::FinalizeBlock { sequence, digest } => {
                self.service.finalize_block(sequence, digest)
            }
            Action::CompactLog { up_to } => self.store.compact(up_to)?,
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;
    use pbft_engine::PbftConfig;
    use pbft_types::{CommitMessage, KeyPair, PrePrepareMessage, PrepareMessage};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingService {
        broadcasts: Arc<Mutex<Vec<ConsensusMessage>>>,
        candidate_requests: Arc<Mutex<Vec<SequenceNumber>>>,
        finalized: Arc<Mutex<Vec<(SequenceNumber, Hash)>>>,
    }

    impl ConsensusService for RecordingService {
        fn broadcast(&mut self, message: ConsensusMessage) {
            self.broadcasts.lock().unwrap().push(message);
        }
        fn request_block_candidate(&mut self, sequence: SequenceNumber) {
            self.candidate_requests.lock().unwrap().push(sequence);
        }
        fn finalize_block(&mut self, sequence: SequenceNumber, digest: Hash) {
            self.finalized.lock().unwrap().push((sequence, digest));
        }
    }

    fn keypairs(n: u8) -> Vec<KeyPair> {
        (0..n).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn make_state(keys: &[KeyPair], index: usize) -> PbftState {
        let config = PbftConfig::new(keys.iter().map(|k| k.public_key().into()).collect())
            .with_idle_timeout(Duration::from_secs(10))
            .with_commit_timeout(Duration::from_secs(10))
            .with_forced_view_change_period(0);
        PbftState::new(config, keys[index].clone()).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_primary_requests_and_proposes() {
        let keys = keypairs(4);
        let service = RecordingService::default();
        let (runner, handle) = ProductionRunner::new(
            make_state(&keys, 0),
            service.clone(),
            Box::new(MemoryLogStore::new()),
            64,
        );
        let (shutdown, shutdown_rx) = ShutdownHandle::new();
        let task = tokio::spawn(runner.run(shutdown_rx));
        settle().await;

        assert_eq!(*service.candidate_requests.lock().unwrap(), vec![1]);

        handle
            .block_candidate(BlockCandidate::new(Hash::of(b"block-1"), 1, Hash::ZERO))
            .await
            .unwrap();
        settle().await;

        let broadcasts = service.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert!(matches!(broadcasts[0], ConsensusMessage::PrePrepare(_)));
        drop(broadcasts);

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backup_runs_three_phases_to_finalization() {
        let keys = keypairs(4);
        let digest = Hash::of(b"block-1");
        let service = RecordingService::default();
        let (runner, handle) = ProductionRunner::new(
            make_state(&keys, 1),
            service.clone(),
            Box::new(MemoryLogStore::new()),
            64,
        );
        let (shutdown, shutdown_rx) = ShutdownHandle::new();
        let task = tokio::spawn(runner.run(shutdown_rx));

        handle
            .deliver(ConsensusMessage::PrePrepare(PrePrepareMessage::new(
                0, 1, digest, &keys[0],
            )))
            .await
            .unwrap();
        handle
            .deliver(ConsensusMessage::Prepare(PrepareMessage::new(
                0, 1, digest, &keys[2],
            )))
            .await
            .unwrap();
        handle
            .deliver(ConsensusMessage::Commit(CommitMessage::new(
                0, 1, digest, &keys[0],
            )))
            .await
            .unwrap();
        handle
            .deliver(ConsensusMessage::Commit(CommitMessage::new(
                0, 1, digest, &keys[2],
            )))
            .await
            .unwrap();
        settle().await;

        assert_eq!(*service.finalized.lock().unwrap(), vec![(1, digest)]);
        let kinds: Vec<&str> = service
            .broadcasts
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.type_name())
            .collect();
        assert_eq!(kinds, vec!["Prepare", "Commit"]);

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_timer_fires_view_change() {
        let keys = keypairs(4);
        let service = RecordingService::default();
        let config = PbftConfig::new(keys.iter().map(|k| k.public_key().into()).collect())
            .with_block_publishing_delay(Duration::from_millis(10))
            .with_idle_timeout(Duration::from_millis(50))
            .with_commit_timeout(Duration::from_secs(10));
        let state = PbftState::new(config, keys[2].clone()).unwrap();
        let (runner, _handle) = ProductionRunner::new(
            state,
            service.clone(),
            Box::new(MemoryLogStore::new()),
            64,
        );
        let (shutdown, shutdown_rx) = ShutdownHandle::new();
        let task = tokio::spawn(runner.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let broadcasts = service.broadcasts.lock().unwrap();
        assert!(broadcasts
            .iter()
            .any(|m| matches!(m, ConsensusMessage::ViewChange(_))));
        drop(broadcasts);

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }
}
