//! Persistence interfaces for per-room sync state.

use crate::delta::Delta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Persisted session metadata for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Highest server version applied locally; resume point for pulls
    pub last_acknowledged_version: u64,
}

/// Durable storage for locally queued deltas.
pub trait DeltasRepository {
    /// Load the queued deltas of a room in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn load_deltas(&self, room_id: &str) -> Result<Vec<Delta>, RepositoryError>;

    /// Replace the queued deltas of a room, preserving the given order.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn save_deltas(&self, room_id: &str, deltas: &[Delta]) -> Result<(), RepositoryError>;
}

/// Durable storage for session metadata.
pub trait MetadataRepository {
    /// Load the metadata of a room, if any was saved.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn load_metadata(&self, room_id: &str) -> Result<Option<SyncMetadata>, RepositoryError>;

    /// Save the metadata of a room.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn save_metadata(&self, room_id: &str, metadata: &SyncMetadata)
        -> Result<(), RepositoryError>;
}

/// Errors for repository operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// The backing store failed
    #[error("storage error: {0}")]
    Storage(String),
    /// A stored record could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    deltas: HashMap<String, Vec<Delta>>,
    metadata: HashMap<String, SyncMetadata>,
    fail_writes: bool,
}

/// In-memory repository.
///
/// Clones share state, so a test can keep a handle while the queue owns
/// another one.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl DeltasRepository for MemoryRepository {
    fn load_deltas(&self, room_id: &str) -> Result<Vec<Delta>, RepositoryError> {
        Ok(self.lock().deltas.get(room_id).cloned().unwrap_or_default())
    }

    fn save_deltas(&self, room_id: &str, deltas: &[Delta]) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RepositoryError::Storage("writes disabled".to_string()));
        }
        state.deltas.insert(room_id.to_string(), deltas.to_vec());
        Ok(())
    }
}

impl MetadataRepository for MemoryRepository {
    fn load_metadata(&self, room_id: &str) -> Result<Option<SyncMetadata>, RepositoryError> {
        Ok(self.lock().metadata.get(room_id).copied())
    }

    fn save_metadata(
        &self,
        room_id: &str,
        metadata: &SyncMetadata,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RepositoryError::Storage("writes disabled".to_string()));
        }
        state.metadata.insert(room_id.to_string(), *metadata);
        Ok(())
    }
}
