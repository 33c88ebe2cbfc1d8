//! Message log persistence.
//!
//! Accepted messages are persisted before broadcast so a restarted node can
//! rebuild its in-flight state without equivocating. Two backends: an
//! in-memory store for tests and ephemeral nodes, and an append-only
//! JSON-lines file for real deployments.
//!
//! All operations are synchronous blocking I/O. The runner calls them from
//! its event loop; the write volume is one small line per accepted message.

use pbft_engine::StorageBackend;
use pbft_types::{ConsensusMessage, MessageKind, SequenceNumber};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable store for accepted consensus messages.
pub trait LogStore: Send {
    /// Append one message. Must be durable before the caller broadcasts.
    fn append(&mut self, message: &ConsensusMessage) -> Result<(), StorageError>;

    /// Drop phase messages at or below a finalized sequence number.
    /// View-change messages are kept; they are not sequence-scoped.
    fn compact(&mut self, up_to: SequenceNumber) -> Result<(), StorageError>;

    /// Load every retained message in append order.
    fn load(&self) -> Result<Vec<ConsensusMessage>, StorageError>;
}

fn survives_compaction(message: &ConsensusMessage, up_to: SequenceNumber) -> bool {
    match message.kind() {
        MessageKind::ViewChange | MessageKind::NewView => true,
        _ => message.sequence() > up_to,
    }
}

/// Open the store named by a config backend selection.
pub fn open_store(backend: &StorageBackend) -> Result<Box<dyn LogStore>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryLogStore::new())),
        StorageBackend::Disk(path) => Ok(Box::new(DiskLogStore::open(path)?)),
    }
}

/// Volatile store. Messages do not survive a process restart.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    messages: Vec<ConsensusMessage>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, message: &ConsensusMessage) -> Result<(), StorageError> {
        self.messages.push(message.clone());
        Ok(())
    }

    fn compact(&mut self, up_to: SequenceNumber) -> Result<(), StorageError> {
        self.messages.retain(|m| survives_compaction(m, up_to));
        Ok(())
    }

    fn load(&self) -> Result<Vec<ConsensusMessage>, StorageError> {
        Ok(self.messages.clone())
    }
}

/// Append-only JSON-lines file, one message per line.
///
/// Compaction rewrites the file through a temp sibling and renames it into
/// place, so a crash mid-compaction leaves either the old or the new file.
pub struct DiskLogStore {
    path: PathBuf,
    file: File,
}

impl DiskLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "opened message log");
        Ok(Self { path, file })
    }
}

impl LogStore for DiskLogStore {
    fn append(&mut self, message: &ConsensusMessage) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn compact(&mut self, up_to: SequenceNumber) -> Result<(), StorageError> {
        let retained: Vec<ConsensusMessage> = self
            .load()?
            .into_iter()
            .filter(|m| survives_compaction(m, up_to))
            .collect();

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        for message in &retained {
            let mut line = serde_json::to_vec(message)?;
            line.push(b'\n');
            tmp.write_all(&line)?;
        }
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;

        debug!(up_to, retained = retained.len(), "compacted message log");
        Ok(())
    }

    fn load(&self) -> Result<Vec<ConsensusMessage>, StorageError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(&line)?);
        }
        Ok(messages)
    }
}
