//! Liveness tests for the simulated validator network.

use pbft_engine::Mode;
use pbft_simulation::{NetworkConfig, SimulationRunner};
use std::time::Duration;
use tracing_test::traced_test;

/// Every pair of nodes agrees on the digests of their common chain prefix.
fn assert_chains_consistent(runner: &SimulationRunner, num_nodes: u32) {
    for a in 0..num_nodes {
        for b in (a + 1)..num_nodes {
            let chain_a = runner.finalized_chain(a);
            let chain_b = runner.finalized_chain(b);
            let common = chain_a.len().min(chain_b.len());
            assert_eq!(
                &chain_a[..common],
                &chain_b[..common],
                "nodes {a} and {b} disagree on their common prefix"
            );
        }
    }
}

#[traced_test]
#[test]
fn test_four_nodes_finalize_blocks() {
    let mut runner = SimulationRunner::with_tuning(NetworkConfig::default(), 42, |config| {
        config.with_forced_view_change_period(0)
    });
    runner.start();
    runner.run_until(Duration::from_secs(10));

    for node in 0..4 {
        let chain = runner.finalized_chain(node);
        assert!(
            chain.len() >= 5,
            "node {node} finalized only {} blocks",
            chain.len()
        );
        // Sequences are strictly sequential from 1.
        for (i, (sequence, _)) in chain.iter().enumerate() {
            assert_eq!(*sequence, i as u64 + 1);
        }
    }
    assert_chains_consistent(&runner, 4);
}

#[traced_test]
#[test]
fn test_silent_primary_triggers_view_change() {
    let mut runner = SimulationRunner::with_tuning(NetworkConfig::default(), 7, |config| {
        config.with_forced_view_change_period(0)
    });
    runner.network_mut().isolate_node(0);
    runner.start();
    runner.run_until(Duration::from_secs(15));

    // The remaining three nodes moved past view 0 and resumed finalizing
    // under the next primary.
    for node in 1..4 {
        assert!(
            runner.node(node).current_view() >= 1,
            "node {node} never left view 0"
        );
        assert_eq!(runner.node(node).mode(), Mode::Normal);
        assert!(
            !runner.finalized_chain(node).is_empty(),
            "node {node} finalized nothing after the view change"
        );
    }
    assert_chains_consistent(&runner, 4);
}

#[traced_test]
#[test]
fn test_forced_view_change_rotates_primary() {
    let mut runner = SimulationRunner::with_tuning(NetworkConfig::default(), 11, |config| {
        config.with_forced_view_change_period(2)
    });
    runner.start();
    runner.run_until(Duration::from_secs(15));

    for node in 0..4 {
        // Rotation happened without any fault.
        assert!(
            runner.node(node).current_view() >= 2,
            "node {node} never rotated"
        );
    }
    // Finalization continued across the rotations on a quorum of nodes.
    let progressing = (0..4)
        .filter(|&n| runner.finalized_chain(n).len() >= 4)
        .count();
    assert!(progressing >= 3, "rotation stalled the network");
    assert_chains_consistent(&runner, 4);
}

#[traced_test]
#[test]
fn test_liveness_under_packet_loss() {
    let config = NetworkConfig {
        packet_loss_rate: 0.02,
        ..NetworkConfig::default()
    };
    let mut runner = SimulationRunner::with_tuning(config, 99, |config| {
        config.with_forced_view_change_period(0)
    });
    runner.start();
    runner.run_until(Duration::from_secs(20));

    assert!(runner.stats().messages_dropped_loss > 0);
    // A node that loses a PrePrepare can stall (there is no retransmission),
    // but the network as a whole keeps finalizing.
    let longest = (0..4)
        .map(|n| runner.finalized_chain(n).len())
        .max()
        .unwrap();
    assert!(longest >= 5, "network stalled under packet loss");
    assert_chains_consistent(&runner, 4);
}

#[traced_test]
#[test]
fn test_consensus_survives_one_isolated_backup() {
    let mut runner = SimulationRunner::with_tuning(NetworkConfig::default(), 5, |config| {
        config.with_forced_view_change_period(0)
    });
    runner.network_mut().isolate_node(3);
    runner.start();
    runner.run_until(Duration::from_secs(10));

    // f = 1: three live nodes are a quorum and keep finalizing.
    for node in 0..3 {
        assert!(
            runner.finalized_chain(node).len() >= 5,
            "node {node} stalled with one backup isolated"
        );
    }
    assert!(runner.finalized_chain(3).is_empty());
    assert_chains_consistent(&runner, 4);
}

#[traced_test]
#[test]
fn test_seven_nodes_tolerate_two_faults() {
    let config = NetworkConfig {
        num_nodes: 7,
        ..NetworkConfig::default()
    };
    let mut runner = SimulationRunner::with_tuning(config, 13, |config| {
        config.with_forced_view_change_period(0)
    });
    runner.network_mut().isolate_node(5);
    runner.network_mut().isolate_node(6);
    runner.start();
    runner.run_until(Duration::from_secs(10));

    for node in 0..5 {
        assert!(
            runner.finalized_chain(node).len() >= 3,
            "node {node} stalled with two nodes isolated"
        );
    }
    assert_chains_consistent(&runner, 7);
}
