//! Block candidates produced by the external ledger.

use crate::{Hash, SequenceNumber};
use serde::{Deserialize, Serialize};

/// A block candidate handed to the engine by the ledger collaborator.
///
/// The engine never looks inside a block; it agrees on the digest. The
/// candidate is immutable once proposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCandidate {
    /// Opaque content identifier of the proposed block.
    pub digest: Hash,
    /// The chain height this candidate is proposed at.
    pub sequence: SequenceNumber,
    /// Identifier of the block this candidate builds on.
    pub previous: Hash,
}

impl BlockCandidate {
    /// Create a candidate.
    pub fn new(digest: Hash, sequence: SequenceNumber, previous: Hash) -> Self {
        Self {
            digest,
            sequence,
            previous,
        }
    }
}
