//! Consensus message types.
//!
//! Each message is self-authenticating: it carries the signer's identity and
//! a signature over the canonical bytes from [`crate::signing`]. Constructors
//! take the local keypair and sign; `verify` re-derives the bytes and checks
//! the carried signature against the carried signer.

use crate::crypto::{KeyPair, Signature};
use crate::membership::PeerId;
use crate::signing;
use crate::{Hash, SequenceNumber, ViewNumber};
use serde::{Deserialize, Serialize};

/// Which phase of the protocol a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
    NewView,
}

/// Identity of a message for deduplication.
///
/// Two messages with the same key are the same vote; a second arrival is
/// dropped without counting. A Byzantine peer that equivocates produces
/// different digests and therefore different keys, but vote counting is by
/// distinct signer so it still gets at most one vote per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey {
    pub kind: MessageKind,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub signer: PeerId,
    pub digest: Hash,
}

/// The primary's proposal for a sequence number within a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepareMessage {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub signer: PeerId,
    pub signature: Signature,
}

impl PrePrepareMessage {
    /// Build and sign a proposal.
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        keypair: &KeyPair,
    ) -> Self {
        let bytes = signing::pre_prepare_message_bytes(view, sequence, &digest);
        Self {
            view,
            sequence,
            digest,
            signer: keypair.public_key().into(),
            signature: keypair.sign(&bytes),
        }
    }

    /// Check the carried signature against the carried signer.
    pub fn verify(&self) -> bool {
        let bytes = signing::pre_prepare_message_bytes(self.view, self.sequence, &self.digest);
        match self.signer.public_key() {
            Ok(key) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// A replica's endorsement of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub signer: PeerId,
    pub signature: Signature,
}

impl PrepareMessage {
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        keypair: &KeyPair,
    ) -> Self {
        let bytes = signing::prepare_message_bytes(view, sequence, &digest);
        Self {
            view,
            sequence,
            digest,
            signer: keypair.public_key().into(),
            signature: keypair.sign(&bytes),
        }
    }

    pub fn verify(&self) -> bool {
        let bytes = signing::prepare_message_bytes(self.view, self.sequence, &self.digest);
        match self.signer.public_key() {
            Ok(key) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// A replica's vote to finalize a prepared proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub signer: PeerId,
    pub signature: Signature,
}

impl CommitMessage {
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        keypair: &KeyPair,
    ) -> Self {
        let bytes = signing::commit_message_bytes(view, sequence, &digest);
        Self {
            view,
            sequence,
            digest,
            signer: keypair.public_key().into(),
            signature: keypair.sign(&bytes),
        }
    }

    pub fn verify(&self) -> bool {
        let bytes = signing::commit_message_bytes(self.view, self.sequence, &self.digest);
        match self.signer.public_key() {
            Ok(key) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// Evidence that a proposal reached the prepared point in some earlier view.
///
/// Carried inside ViewChange messages so the next primary can re-propose
/// anything that may already have been finalized by another replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Hash,
}

/// A replica's vote to abandon the current view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    /// The view the sender wants to move to.
    pub new_view: ViewNumber,
    /// The highest sequence the sender has finalized.
    pub last_stable_sequence: SequenceNumber,
    /// Proposals the sender prepared but did not finalize.
    pub prepared: Vec<PreparedCertificate>,
    pub signer: PeerId,
    pub signature: Signature,
}

impl ViewChangeMessage {
    pub fn new(
        new_view: ViewNumber,
        last_stable_sequence: SequenceNumber,
        prepared: Vec<PreparedCertificate>,
        keypair: &KeyPair,
    ) -> Self {
        let bytes = signing::view_change_message_bytes(new_view, last_stable_sequence, &prepared);
        Self {
            new_view,
            last_stable_sequence,
            prepared,
            signer: keypair.public_key().into(),
            signature: keypair.sign(&bytes),
        }
    }

    pub fn verify(&self) -> bool {
        let bytes = signing::view_change_message_bytes(
            self.new_view,
            self.last_stable_sequence,
            &self.prepared,
        );
        match self.signer.public_key() {
            Ok(key) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Digest binding this message's content, used in the dedup key so two
    /// different ViewChange payloads from one signer are distinct messages.
    pub fn content_digest(&self) -> Hash {
        let bytes = signing::view_change_message_bytes(
            self.new_view,
            self.last_stable_sequence,
            &self.prepared,
        );
        Hash::of(&bytes)
    }
}

/// The new primary's announcement that a view change succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewViewMessage {
    /// The view being entered.
    pub view: ViewNumber,
    /// The quorum of ViewChange messages justifying the change.
    pub view_changes: Vec<ViewChangeMessage>,
    /// Re-proposals for every prepared certificate carried by the quorum.
    pub pre_prepares: Vec<PrePrepareMessage>,
    pub signer: PeerId,
    pub signature: Signature,
}

impl NewViewMessage {
    pub fn new(
        view: ViewNumber,
        view_changes: Vec<ViewChangeMessage>,
        pre_prepares: Vec<PrePrepareMessage>,
        keypair: &KeyPair,
    ) -> Self {
        let bytes = signing::new_view_message_bytes(view, &view_changes, &pre_prepares);
        Self {
            view,
            view_changes,
            pre_prepares,
            signer: keypair.public_key().into(),
            signature: keypair.sign(&bytes),
        }
    }

    /// Check the primary's own signature. Validating the carried quorum is
    /// the engine's job; this only covers the outer envelope.
    pub fn verify(&self) -> bool {
        let bytes =
            signing::new_view_message_bytes(self.view, &self.view_changes, &self.pre_prepares);
        match self.signer.public_key() {
            Ok(key) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }

    pub fn content_digest(&self) -> Hash {
        let bytes =
            signing::new_view_message_bytes(self.view, &self.view_changes, &self.pre_prepares);
        Hash::of(&bytes)
    }
}

/// Any message a peer can send on the consensus topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    PrePrepare(PrePrepareMessage),
    Prepare(PrepareMessage),
    Commit(CommitMessage),
    ViewChange(ViewChangeMessage),
    NewView(NewViewMessage),
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusMessage::PrePrepare(_) => MessageKind::PrePrepare,
            ConsensusMessage::Prepare(_) => MessageKind::Prepare,
            ConsensusMessage::Commit(_) => MessageKind::Commit,
            ConsensusMessage::ViewChange(_) => MessageKind::ViewChange,
            ConsensusMessage::NewView(_) => MessageKind::NewView,
        }
    }

    /// The view this message speaks about. For a ViewChange that is the
    /// target view, not the view being abandoned.
    pub fn view(&self) -> ViewNumber {
        match self {
            ConsensusMessage::PrePrepare(m) => m.view,
            ConsensusMessage::Prepare(m) => m.view,
            ConsensusMessage::Commit(m) => m.view,
            ConsensusMessage::ViewChange(m) => m.new_view,
            ConsensusMessage::NewView(m) => m.view,
        }
    }

    /// The sequence this message speaks about. View-change traffic is not
    /// tied to a single slot and reports the sender's last stable sequence
    /// (zero for NewView).
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            ConsensusMessage::PrePrepare(m) => m.sequence,
            ConsensusMessage::Prepare(m) => m.sequence,
            ConsensusMessage::Commit(m) => m.sequence,
            ConsensusMessage::ViewChange(m) => m.last_stable_sequence,
            ConsensusMessage::NewView(_) => 0,
        }
    }

    pub fn signer(&self) -> PeerId {
        match self {
            ConsensusMessage::PrePrepare(m) => m.signer,
            ConsensusMessage::Prepare(m) => m.signer,
            ConsensusMessage::Commit(m) => m.signer,
            ConsensusMessage::ViewChange(m) => m.signer,
            ConsensusMessage::NewView(m) => m.signer,
        }
    }

    /// Identity for duplicate suppression.
    pub fn dedup_key(&self) -> DedupKey {
        let digest = match self {
            ConsensusMessage::PrePrepare(m) => m.digest,
            ConsensusMessage::Prepare(m) => m.digest,
            ConsensusMessage::Commit(m) => m.digest,
            ConsensusMessage::ViewChange(m) => m.content_digest(),
            ConsensusMessage::NewView(m) => m.content_digest(),
        };
        DedupKey {
            kind: self.kind(),
            view: self.view(),
            sequence: self.sequence(),
            signer: self.signer(),
            digest,
        }
    }

    /// Check the sender's signature over the canonical bytes.
    pub fn verify(&self) -> bool {
        match self {
            ConsensusMessage::PrePrepare(m) => m.verify(),
            ConsensusMessage::Prepare(m) => m.verify(),
            ConsensusMessage::Commit(m) => m.verify(),
            ConsensusMessage::ViewChange(m) => m.verify(),
            ConsensusMessage::NewView(m) => m.verify(),
        }
    }

    /// Short name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NewView(_) => "NewView",
        }
    }
}
