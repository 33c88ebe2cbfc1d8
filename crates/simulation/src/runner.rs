//! Deterministic simulation runner.
//!
//! Drives a set of consensus state machines from a single ordered event
//! queue under simulated time. All I/O a production runner would perform
//! is resolved inline: broadcasts become scheduled delivery events, timers
//! become queue entries, and block candidates are fabricated on request.
//! Given the same seed, a run produces identical results every time.

use crate::event_queue::{EventKey, NodeIndex};
use crate::network::{NetworkConfig, SimulatedNetwork};
use pbft_core::{Action, Event, StateMachine, TimerId};
use pbft_engine::{PbftConfig, PbftState};
use pbft_types::{BlockCandidate, ConsensusMessage, Hash, KeyPair, PeerId, SequenceNumber};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Statistics collected during a simulation run.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_generated: u64,
    pub messages_sent: u64,
    pub messages_dropped_partition: u64,
    pub messages_dropped_loss: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

impl SimulationStats {
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }
}

pub struct SimulationRunner {
    nodes: Vec<PbftState>,
    keys: Vec<KeyPair>,

    /// Global event queue in deterministic order.
    event_queue: BTreeMap<EventKey, Event>,
    /// Tie-breaking counter for queue keys.
    sequence: u64,
    now: Duration,

    network: SimulatedNetwork,
    rng: ChaCha8Rng,

    /// Pending timer entries, for cancellation.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    /// Finalized (sequence, digest) pairs per node, in finalization order.
    finalized: Vec<Vec<(SequenceNumber, Hash)>>,

    stats: SimulationStats,
}

impl SimulationRunner {
    /// Build a simulation with deterministic per-node keys derived from
    /// `seed` and consensus timings suited to simulated time.
    pub fn new(network_config: NetworkConfig, seed: u64) -> Self {
        Self::with_tuning(network_config, seed, |config| config)
    }

    /// Like [`SimulationRunner::new`], with a hook to adjust each node's
    /// consensus config before the node is built.
    pub fn with_tuning(
        network_config: NetworkConfig,
        seed: u64,
        tune: impl Fn(PbftConfig) -> PbftConfig,
    ) -> Self {
        let network = SimulatedNetwork::new(network_config.clone());
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let keys: Vec<KeyPair> = (0..network_config.num_nodes)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed.wrapping_add(i as u64).wrapping_mul(0x517cc1b727220a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();
        let members: Vec<PeerId> = keys.iter().map(|k| k.public_key().into()).collect();

        let nodes: Vec<PbftState> = keys
            .iter()
            .map(|keypair| {
                let config = tune(
                    PbftConfig::new(members.clone())
                        .with_block_publishing_delay(Duration::from_millis(100))
                        .with_idle_timeout(Duration::from_secs(2))
                        .with_commit_timeout(Duration::from_secs(2))
                        .with_view_change_duration(Duration::from_secs(1)),
                );
                PbftState::new(config, keypair.clone())
                    .unwrap_or_else(|e| panic!("invalid simulation config: {e}"))
            })
            .collect();

        let num_nodes = nodes.len();
        info!(num_nodes, seed, "created simulation runner");

        Self {
            nodes,
            keys,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            finalized: vec![Vec::new(); num_nodes],
            stats: SimulationStats::default(),
        }
    }

    // ─── Accessors ───

    pub fn node(&self, index: NodeIndex) -> &PbftState {
        &self.nodes[index as usize]
    }

    pub fn keypair(&self, index: NodeIndex) -> &KeyPair {
        &self.keys[index as usize]
    }

    /// The blocks a node has finalized, in order.
    pub fn finalized_chain(&self, index: NodeIndex) -> &[(SequenceNumber, Hash)] {
        &self.finalized[index as usize]
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ─── Driving the simulation ───

    /// Emit every node's startup actions. Call once before `run_until`.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            let actions = self.nodes[index as usize].start();
            for action in actions {
                self.process_action(index, action);
            }
        }
    }

    /// Schedule delivery of a message to one node, bypassing the network
    /// model. For fault-injection tests.
    pub fn inject_message(&mut self, to: NodeIndex, delay: Duration, message: ConsensusMessage) {
        let time = self.now + delay;
        self.schedule_event(to, time, message_event(message));
    }

    /// Process events in deterministic order until the queue drains or
    /// simulated time passes `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let (key, event) = match self.event_queue.pop_first() {
                Some(entry) => entry,
                None => break,
            };
            self.now = key.time;
            let node_index = key.node_index;

            trace!(time = ?self.now, node = node_index, event = event.type_name(), "processing");
            self.stats.events_processed += 1;

            let node = &mut self.nodes[node_index as usize];
            node.set_time(self.now);
            let actions = node.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node_index, action);
            }
        }
        debug!(
            events = self.stats.events_processed,
            final_time = ?self.now,
            "simulation step complete"
        );
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        self.try_deliver(from, to, message.clone());
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                // Replacing a pending timer removes the stale queue entry.
                if let Some(stale) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&stale);
                }
                let key = self.schedule_event(from, self.now + duration, timer_event(id));
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.sequence += 1;
                let key = EventKey::internal(self.now, from, self.sequence);
                self.event_queue.insert(key, event);
            }

            Action::RequestBlockCandidate { sequence } => {
                let candidate = self.fabricate_candidate(from, sequence);
                let delay = self.nodes[from as usize].config().block_publishing_delay;
                self.schedule_event(
                    from,
                    self.now + delay,
                    Event::BlockCandidateReady { candidate },
                );
            }

            Action::FinalizeBlock { sequence, digest } => {
                self.finalized[from as usize].push((sequence, digest));
            }

            // Persistence is a production concern; the simulation holds
            // everything in memory.
            Action::PersistMessage { .. } | Action::CompactLog { .. } => {}
        }
    }

    /// Deterministic stand-in for the ledger's block assembly: the digest
    /// depends only on the proposer and the sequence number.
    fn fabricate_candidate(&self, proposer: NodeIndex, sequence: SequenceNumber) -> BlockCandidate {
        let mut bytes = Vec::with_capacity(20);
        bytes.extend_from_slice(b"sim.block:");
        bytes.extend_from_slice(&sequence.to_le_bytes());
        bytes.extend_from_slice(&(proposer as u64).to_le_bytes());
        let previous = self.finalized[proposer as usize]
            .last()
            .map(|(_, digest)| *digest)
            .unwrap_or(Hash::ZERO);
        BlockCandidate::new(Hash::of(&bytes), sequence, previous)
    }

    fn try_deliver(&mut self, from: NodeIndex, to: NodeIndex, message: ConsensusMessage) {
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            return;
        }
        let latency = self.network.sample_latency(&mut self.rng);
        self.stats.messages_sent += 1;
        self.schedule_event(to, self.now + latency, message_event(message));
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Idle => Event::IdleTimeout,
        TimerId::Commit => Event::CommitTimeout,
        TimerId::ViewChange => Event::ViewChangeTimeout,
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
