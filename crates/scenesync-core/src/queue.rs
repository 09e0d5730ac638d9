//! Durable queue of locally authored, unacknowledged deltas.
//!
//! The queue only ever appends at the tail or removes members by id; it never
//! reorders. Every mutation is written through to the repository so the queue
//! survives reconnects and restarts. The in-memory state stays authoritative
//! for the running session even when a write fails.

use crate::delta::{Delta, DeltaId};
use crate::repository::{DeltasRepository, RepositoryError};
use indexmap::IndexMap;

/// Insertion-ordered map of pending local deltas.
#[derive(Debug)]
pub struct LocalDeltaQueue<R> {
    repository: R,
    room_id: String,
    deltas: IndexMap<DeltaId, Delta>,
}

impl<R: DeltasRepository> LocalDeltaQueue<R> {
    /// Load the persisted queue of a room.
    ///
    /// # Errors
    ///
    /// Returns error if the repository cannot be read.
    pub fn create(repository: R, room_id: impl Into<String>) -> Result<Self, QueueError> {
        let room_id = room_id.into();
        let stored = repository
            .load_deltas(&room_id)
            .map_err(|source| QueueError::Load {
                room_id: room_id.clone(),
                source,
            })?;

        let mut deltas = IndexMap::with_capacity(stored.len());
        for delta in stored {
            deltas.entry(delta.id.clone()).or_insert(delta);
        }

        tracing::debug!(room_id = %room_id, queued = deltas.len(), "Loaded local delta queue");

        Ok(Self {
            repository,
            room_id,
            deltas,
        })
    }

    /// Append a delta; an existing delta with the same id is overwritten in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be persisted.
    pub fn add(&mut self, delta: Delta) -> Result<(), QueueError> {
        self.deltas.insert(delta.id.clone(), delta);
        self.persist()
    }

    /// Remove a delta by id.
    ///
    /// Returns the removed delta, or `None` if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be persisted.
    pub fn remove(&mut self, id: &DeltaId) -> Result<Option<Delta>, QueueError> {
        let removed = self.deltas.shift_remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove several deltas with a single write.
    ///
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be persisted.
    pub fn remove_all<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a DeltaId>,
    ) -> Result<usize, QueueError> {
        let removed = ids
            .into_iter()
            .filter(|id| self.deltas.shift_remove(*id).is_some())
            .count();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Check if a delta is queued.
    #[must_use]
    pub fn has(&self, id: &DeltaId) -> bool {
        self.deltas.contains_key(id)
    }

    /// Get a queued delta by id.
    #[must_use]
    pub fn get(&self, id: &DeltaId) -> Option<&Delta> {
        self.deltas.get(id)
    }

    /// Snapshot of all queued deltas in insertion order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Delta> {
        self.deltas.values().cloned().collect()
    }

    /// Iterate over queued deltas in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values()
    }

    /// Get the number of queued deltas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Room this queue belongs to.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The backing repository.
    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn persist(&self) -> Result<(), QueueError> {
        let deltas: Vec<Delta> = self.deltas.values().cloned().collect();
        self.repository
            .save_deltas(&self.room_id, &deltas)
            .map_err(|source| QueueError::Persist {
                room_id: self.room_id.clone(),
                source,
            })
    }
}

/// Errors for queue operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Loading the persisted queue failed
    #[error("failed to load queue for room '{room_id}': {source}")]
    Load {
        /// Room identifier
        room_id: String,
        /// Underlying repository error
        #[source]
        source: RepositoryError,
    },
    /// Writing the queue failed
    #[error("failed to persist queue for room '{room_id}': {source}")]
    Persist {
        /// Room identifier
        room_id: String,
        /// Underlying repository error
        #[source]
        source: RepositoryError,
    },
}
