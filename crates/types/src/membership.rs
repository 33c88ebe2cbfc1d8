//! Validator membership and quorum arithmetic.

use crate::crypto::{PublicKey, SignatureError};
use crate::ViewNumber;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Error constructing or querying a membership list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// PBFT needs at least 4 members to tolerate one fault.
    #[error("membership requires at least 4 members, got {0}")]
    TooFewMembers(usize),
    /// The same peer appeared twice in the member list.
    #[error("duplicate member {0}")]
    DuplicateMember(PeerId),
}

/// A validator identity: the 32 raw bytes of its public key.
///
/// Using the key bytes as the identity means membership alone is enough to
/// verify any member's signature.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Construct from raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The verifier for this peer's signatures.
    pub fn public_key(&self) -> Result<PublicKey, SignatureError> {
        PublicKey::from_bytes(&self.0)
    }
}

impl From<PublicKey> for PeerId {
    fn from(key: PublicKey) -> Self {
        PeerId(key.to_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", &hex::encode(self.0)[..8])
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let decoded =
            hex::decode(&s).map_err(|e| D::Error::custom(format!("invalid hex: {e}")))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| D::Error::custom("peer id must be 32 bytes"))?;
        Ok(PeerId(bytes))
    }
}

/// The ordered set of validators for the network.
///
/// Immutable during a view; replaced wholesale when an on-chain settings
/// update is applied at a block boundary. With `n` members the network
/// tolerates `f = (n - 1) / 3` faults and a quorum is `2f + 1` votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: Vec<PeerId>,
}

impl Membership {
    /// Build a membership from an ordered member list.
    pub fn new(members: Vec<PeerId>) -> Result<Self, MembershipError> {
        if members.len() < 4 {
            return Err(MembershipError::TooFewMembers(members.len()));
        }
        for (i, member) in members.iter().enumerate() {
            if members[..i].contains(member) {
                return Err(MembershipError::DuplicateMember(*member));
            }
        }
        Ok(Self { members })
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Memberships are never empty; kept for clippy's sake.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The ordered member list.
    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    /// Whether `peer` is a member.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Maximum number of Byzantine members tolerated: `(n - 1) / 3`.
    pub fn max_faulty(&self) -> u64 {
        (self.members.len() as u64 - 1) / 3
    }

    /// Votes needed to advance a phase: `2f + 1`.
    pub fn quorum(&self) -> u64 {
        2 * self.max_faulty() + 1
    }

    /// The primary for a view: `members[view % n]`.
    pub fn primary_for(&self, view: ViewNumber) -> PeerId {
        self.members[(view % self.members.len() as u64) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn membership_of(n: u8) -> Membership {
        Membership::new((0..n).map(peer).collect()).unwrap()
    }

    #[test]
    fn test_quorum_arithmetic() {
        // N=4 -> f=1, quorum=3; N=7 -> f=2, quorum=5.
        let four = membership_of(4);
        assert_eq!(four.max_faulty(), 1);
        assert_eq!(four.quorum(), 3);

        let seven = membership_of(7);
        assert_eq!(seven.max_faulty(), 2);
        assert_eq!(seven.quorum(), 5);
    }

    #[test]
    fn test_rejects_small_membership() {
        let err = Membership::new(vec![peer(0), peer(1), peer(2)]).unwrap_err();
        assert_eq!(err, MembershipError::TooFewMembers(3));
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = Membership::new(vec![peer(0), peer(1), peer(2), peer(1)]).unwrap_err();
        assert_eq!(err, MembershipError::DuplicateMember(peer(1)));
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let members = membership_of(4);
        assert_eq!(members.primary_for(0), peer(0));
        assert_eq!(members.primary_for(1), peer(1));
        assert_eq!(members.primary_for(4), peer(0));
        assert_eq!(members.primary_for(6), peer(2));
    }
}
