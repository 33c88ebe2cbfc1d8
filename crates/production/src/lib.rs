//! Production runner with async I/O.
//!
//! Wraps the deterministic state machine with real-world concerns:
//!
//! - Events arrive on a tokio mpsc channel and are handled one at a time by
//!   a single task that owns the state machine (no locks)
//! - Timers are a deadline table the event loop sleeps against
//! - Accepted messages are persisted (memory or JSON-lines file) before
//!   they are broadcast, so a restart cannot equivocate
//! - On-chain settings are fetched with exponential backoff and fed in as
//!   ordinary events
//!
//! Transport and ledger integration stay behind [`ConsensusService`]; this
//! crate does not pick a network stack.

pub mod backoff;
pub mod runner;
pub mod settings;
pub mod storage;
pub mod telemetry;
pub mod timers;

pub use backoff::retry_until_ok;
pub use runner::{ConsensusService, ProductionRunner, RunnerError, RunnerHandle, ShutdownHandle};
pub use settings::{fetch_settings, parse_settings, SettingsError, SettingsSource};
pub use storage::{open_store, DiskLogStore, LogStore, MemoryLogStore, StorageError};
pub use timers::Timers;
