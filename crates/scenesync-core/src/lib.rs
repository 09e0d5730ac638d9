//! # scenesync core
//!
//! Synchronization model for collaborative scenes.
//!
//! This crate provides:
//! - Delta records and server acknowledgements
//! - A durable, insertion-ordered queue of unacknowledged local deltas
//! - The reconciliation engine merging acknowledged history with local work,
//!   with all-or-nothing commits
//! - Per-element version merge for ephemeral relays
//! - The scene, repository and error-sink collaborator interfaces, plus
//!   in-memory implementations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta;
pub mod fault;
pub mod history;
pub mod merge;
pub mod queue;
pub mod reconcile;
pub mod repository;
pub mod scene;

pub use delta::{AcknowledgedDelta, Delta, DeltaId};
pub use fault::{ErrorSink, SyncFault, TracingErrorSink};
pub use history::AckHistory;
pub use merge::merge_relayed;
pub use queue::{LocalDeltaQueue, QueueError};
pub use reconcile::{BatchSummary, Reconciliation, ReconcileFault, ReconciliationEngine};
pub use repository::{
    DeltasRepository, MemoryRepository, MetadataRepository, RepositoryError, SyncMetadata,
};
pub use scene::{
    ApplyError, Change, Element, ElementMap, ElementUpdate, Scene, SceneDelta, SharedScene,
};
