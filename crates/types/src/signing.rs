//! Canonical signing-byte construction.
//!
//! Every consensus message is signed over a domain-separated, fixed-layout
//! byte string rather than over a serialized form, so signatures are
//! independent of the wire encoding. Domain tags prevent a signature for one
//! message kind being replayed as another.

use crate::message::{PreparedCertificate, PrePrepareMessage, ViewChangeMessage};
use crate::{Hash, SequenceNumber, ViewNumber};

/// Domain tag for PrePrepare signatures.
pub const DOMAIN_PRE_PREPARE: &[u8] = b"pbft.pre_prepare:";
/// Domain tag for Prepare signatures.
pub const DOMAIN_PREPARE: &[u8] = b"pbft.prepare:";
/// Domain tag for Commit signatures.
pub const DOMAIN_COMMIT: &[u8] = b"pbft.commit:";
/// Domain tag for ViewChange signatures.
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"pbft.view_change:";
/// Domain tag for NewView signatures.
pub const DOMAIN_NEW_VIEW: &[u8] = b"pbft.new_view:";

fn vote_bytes(
    domain: &[u8],
    view: ViewNumber,
    sequence: SequenceNumber,
    digest: &Hash,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(domain.len() + 8 + 8 + 32);
    message.extend_from_slice(domain);
    message.extend_from_slice(&view.to_le_bytes());
    message.extend_from_slice(&sequence.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message
}

/// Signing bytes for a PrePrepare.
pub fn pre_prepare_message_bytes(
    view: ViewNumber,
    sequence: SequenceNumber,
    digest: &Hash,
) -> Vec<u8> {
    vote_bytes(DOMAIN_PRE_PREPARE, view, sequence, digest)
}

/// Signing bytes for a Prepare.
pub fn prepare_message_bytes(
    view: ViewNumber,
    sequence: SequenceNumber,
    digest: &Hash,
) -> Vec<u8> {
    vote_bytes(DOMAIN_PREPARE, view, sequence, digest)
}

/// Signing bytes for a Commit.
pub fn commit_message_bytes(
    view: ViewNumber,
    sequence: SequenceNumber,
    digest: &Hash,
) -> Vec<u8> {
    vote_bytes(DOMAIN_COMMIT, view, sequence, digest)
}

/// Signing bytes for a ViewChange: target view, last stable sequence, and
/// the full prepared-certificate set.
pub fn view_change_message_bytes(
    new_view: ViewNumber,
    last_stable_sequence: SequenceNumber,
    prepared: &[PreparedCertificate],
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(DOMAIN_VIEW_CHANGE);
    message.extend_from_slice(&new_view.to_le_bytes());
    message.extend_from_slice(&last_stable_sequence.to_le_bytes());
    for cert in prepared {
        message.extend_from_slice(&cert.view.to_le_bytes());
        message.extend_from_slice(&cert.sequence.to_le_bytes());
        message.extend_from_slice(cert.digest.as_bytes());
    }
    message
}

/// Signing bytes for a NewView: the target view plus the signatures of the
/// quorum of ViewChange messages and the re-proposed PrePrepares it carries,
/// binding the NewView to its exact contents.
pub fn new_view_message_bytes(
    view: ViewNumber,
    view_changes: &[ViewChangeMessage],
    pre_prepares: &[PrePrepareMessage],
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(DOMAIN_NEW_VIEW);
    message.extend_from_slice(&view.to_le_bytes());
    for vc in view_changes {
        message.extend_from_slice(vc.signer.as_bytes());
        message.extend_from_slice(&vc.signature.to_bytes());
    }
    for pp in pre_prepares {
        message.extend_from_slice(&pp.view.to_le_bytes());
        message.extend_from_slice(&pp.sequence.to_le_bytes());
        message.extend_from_slice(pp.digest.as_bytes());
    }
    message
}
