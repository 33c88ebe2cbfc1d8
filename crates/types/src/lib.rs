//! Core types for the PBFT consensus engine.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: content digests, opaque signing capability
//! - **Identity**: [`PeerId`], [`Membership`] with quorum arithmetic
//! - **Consensus types**: [`BlockCandidate`], the five consensus messages
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. The
//! signature scheme is deliberately opaque: consumers only see
//! `sign`/`verify`, never the underlying curve.

mod block;
mod crypto;
mod hash;
mod membership;
mod message;
mod signing;

pub use block::BlockCandidate;
pub use crypto::{KeyPair, PublicKey, Signature, SignatureError};
pub use hash::{Hash, HexError};
pub use membership::{Membership, MembershipError, PeerId};
pub use message::{
    CommitMessage, ConsensusMessage, DedupKey, MessageKind, NewViewMessage, PrePrepareMessage,
    PrepareMessage, PreparedCertificate, ViewChangeMessage,
};
pub use signing::{
    commit_message_bytes, new_view_message_bytes, pre_prepare_message_bytes,
    prepare_message_bytes, view_change_message_bytes, DOMAIN_COMMIT, DOMAIN_NEW_VIEW,
    DOMAIN_PRE_PREPARE, DOMAIN_PREPARE, DOMAIN_VIEW_CHANGE,
};

/// A view number. Monotonically increasing; the primary for view `v` is
/// `membership[v % n]`.
pub type ViewNumber = u64;

/// A block sequence number (chain height). Strictly sequential: a node
/// finalizes sequence numbers in order, one block per sequence number.
pub type SequenceNumber = u64;
