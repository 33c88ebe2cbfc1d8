//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::event_queue::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of validators.
    pub num_nodes: u32,
    /// Base one-way message latency.
    pub base_latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this
    /// probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            base_latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Deterministic message delivery decisions.
///
/// Supports configurable latency with jitter, probabilistic packet loss,
/// and directional partitions between node pairs.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// If (a, b) is in this set, messages from a to b are dropped.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partition management ───

    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Drop messages from `from` to `to` (one direction only).
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.partitions.insert((from, to));
    }

    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut a node off from every other node, both directions.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in self.all_nodes() {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet loss ───

    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    // ─── Delivery decision ───

    /// Decide delivery for a message from `from` to `to`. `None` means the
    /// message is dropped; `Some(latency)` means it arrives after `latency`.
    pub fn should_deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        // Partition check is deterministic and consumes no randomness.
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.should_drop_packet(rng) {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.base_latency;
        let jitter_range = base.as_secs_f64() * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.001))
    }

    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.config.num_nodes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_partition_blocks_one_direction() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        network.partition_unidirectional(0, 1);
        assert!(network.should_deliver(0, 1, &mut rng).is_none());
        assert!(network.should_deliver(1, 0, &mut rng).is_some());
    }

    #[test]
    fn test_isolation_and_heal() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate_node(2);
        assert_eq!(network.partition_count(), 6);
        assert!(network.is_partitioned(2, 0));
        assert!(network.is_partitioned(0, 2));

        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_latency_stays_within_jitter_bounds() {
        let network = SimulatedNetwork::new(NetworkConfig {
            base_latency: Duration::from_millis(100),
            jitter_fraction: 0.2,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..100 {
            let latency = network.sample_latency(&mut rng);
            assert!(latency >= Duration::from_millis(80));
            assert!(latency <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.set_packet_loss_rate(1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(network.should_deliver(0, 1, &mut rng).is_none());
    }
}
