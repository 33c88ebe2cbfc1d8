//! The deterministic PBFT consensus engine.
//!
//! [`PbftState`] is a sans-I/O state machine: feed it events through
//! [`pbft_core::StateMachine::handle`] and execute the actions it returns.
//! Everything here is synchronous and deterministic, which makes the whole
//! protocol testable without a network, a clock, or a ledger.
//!
//! Module layout mirrors the protocol's moving parts:
//!
//! - [`config`]: tunables and their on-chain settings keys
//! - [`message_log`]: message retention, dedup, vote counting, phases
//! - [`view_state`]: current view and the Normal/ViewChanging mode
//! - [`view_change`]: vote construction, NewView assembly and validation
//! - [`state`]: the aggregate tying it all together

pub mod config;
pub mod error;
pub mod message_log;
pub mod state;
pub mod view_change;
pub mod view_state;

pub use config::{ConfigError, PbftConfig, StorageBackend};
pub use error::PbftError;
pub use message_log::{MessageLog, Phase, PhaseRecord, RecordOutcome, RejectReason};
pub use state::PbftState;
pub use view_change::{NewViewError, ViewChangeCoordinator};
pub use view_state::{Mode, ViewState};
