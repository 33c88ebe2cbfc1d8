//! Deterministic simulation harness.
//!
//! Runs a whole validator network inside one process with simulated time:
//! a global event queue orders everything, a seeded RNG decides latency and
//! packet loss, and partitions are explicit test inputs. The same seed
//! always produces the same run, which makes consensus failures
//! reproducible instead of flaky.

pub mod event_queue;
pub mod network;
pub mod runner;

pub use event_queue::{EventKey, NodeIndex};
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};
