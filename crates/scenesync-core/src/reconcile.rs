//! Reconciliation of acknowledged batches with outstanding local work.
//!
//! A batch is prepared entirely on a working copy of the scene:
//!
//! 1. Walk the batch in ascending version order. Versions at or below the
//!    last acknowledged one are skipped; any other version must be exactly
//!    one above the running version.
//! 2. Ids found in the local queue are our own deltas coming back; they are
//!    already reflected locally and are not reapplied. Everything else is a
//!    remote delta to apply.
//! 3. Remaining queued deltas are reapplied after the remote ones, in queue
//!    order.
//!
//! Only when every step succeeded is the result committed: the snapshot is
//! published, acknowledged ids leave the queue, and the version advances.
//! A fault commits nothing, so the scene keeps its pre-batch snapshot.

use crate::delta::{AcknowledgedDelta, Delta, DeltaId};
use crate::history::AckHistory;
use crate::queue::LocalDeltaQueue;
use crate::repository::DeltasRepository;
use crate::scene::{ApplyError, ElementMap, Scene};
use std::collections::HashSet;

/// Outcome of reconciling one acknowledgement batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The batch was committed
    Applied(BatchSummary),
    /// The batch was discarded; the scene and queue are untouched
    Fault(ReconcileFault),
}

impl Reconciliation {
    /// Check if the batch was committed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// What a committed batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Last acknowledged version before the batch
    pub previous_version: u64,
    /// Last acknowledged version after the batch
    pub version: u64,
    /// Local deltas confirmed by this batch
    pub acknowledged: Vec<DeltaId>,
    /// Remote deltas applied to the scene
    pub remote_applied: usize,
    /// Still-pending local deltas reapplied on top
    pub local_reapplied: usize,
    /// Already-applied versions that were skipped
    pub skipped: usize,
}

/// Consistency faults that abort a batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileFault {
    /// A version gap or regression inside the batch
    #[error("received out of order delta, expected version {expected}, but received {received}")]
    OutOfOrder {
        /// The only acceptable next version
        expected: u64,
        /// The version actually received
        received: u64,
    },
    /// The scene could not apply a delta
    #[error("failed to apply delta '{delta_id}': {source}")]
    Apply {
        /// The offending delta
        delta_id: DeltaId,
        /// Error raised by the scene
        #[source]
        source: ApplyError,
    },
}

#[derive(Debug)]
struct PreparedBatch {
    elements: ElementMap,
    applied: bool,
    summary: BatchSummary,
}

/// Merges server history with the local queue.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    last_acknowledged_version: u64,
    history: AckHistory,
}

impl ReconciliationEngine {
    /// Create an engine resuming at `last_acknowledged_version`.
    #[must_use]
    pub fn new(last_acknowledged_version: u64, history: AckHistory) -> Self {
        Self {
            last_acknowledged_version,
            history,
        }
    }

    /// Highest server version reflected in the scene.
    #[must_use]
    pub fn last_acknowledged_version(&self) -> u64 {
        self.last_acknowledged_version
    }

    /// Acknowledged deltas retained so far.
    #[must_use]
    pub fn history(&self) -> &AckHistory {
        &self.history
    }

    /// Reconcile an acknowledgement batch against `scene` and `queue`.
    pub fn reconcile<S, R>(
        &mut self,
        batch: &[AcknowledgedDelta],
        scene: &mut S,
        queue: &mut LocalDeltaQueue<R>,
    ) -> Reconciliation
    where
        S: Scene,
        R: DeltasRepository,
    {
        let mut ordered: Vec<&AcknowledgedDelta> = batch.iter().collect();
        ordered.sort_by_key(|delta| delta.version);

        let prepared = match self.prepare(&ordered, scene, queue) {
            Ok(prepared) => prepared,
            Err(fault) => {
                tracing::warn!(
                    room_id = %queue.room_id(),
                    error = %fault,
                    last_acknowledged_version = self.last_acknowledged_version,
                    batch_len = batch.len(),
                    "Discarded acknowledgement batch"
                );
                return Reconciliation::Fault(fault);
            }
        };

        if prepared.applied {
            scene.replace_elements(prepared.elements);
        }

        if let Err(err) = queue.remove_all(&prepared.summary.acknowledged) {
            tracing::error!(error = %err, "Failed to persist acknowledged queue removals");
        }

        for delta in ordered
            .into_iter()
            .filter(|delta| delta.version <= prepared.summary.version)
        {
            self.history.record(delta.clone());
        }

        self.last_acknowledged_version = prepared.summary.version;

        tracing::debug!(
            room_id = %queue.room_id(),
            previous_version = prepared.summary.previous_version,
            version = prepared.summary.version,
            acknowledged = prepared.summary.acknowledged.len(),
            remote_applied = prepared.summary.remote_applied,
            local_reapplied = prepared.summary.local_reapplied,
            skipped = prepared.summary.skipped,
            "Committed acknowledgement batch"
        );

        Reconciliation::Applied(prepared.summary)
    }

    fn prepare<S, R>(
        &self,
        ordered: &[&AcknowledgedDelta],
        scene: &S,
        queue: &LocalDeltaQueue<R>,
    ) -> Result<PreparedBatch, ReconcileFault>
    where
        S: Scene,
        R: DeltasRepository,
    {
        let mut summary = BatchSummary {
            previous_version: self.last_acknowledged_version,
            version: self.last_acknowledged_version,
            ..BatchSummary::default()
        };
        let mut acknowledged = HashSet::new();
        let mut applicable: Vec<Delta> = Vec::new();

        for delta in ordered {
            if delta.version <= summary.version {
                summary.skipped += 1;
                continue;
            }

            if delta.version != summary.version + 1 {
                return Err(ReconcileFault::OutOfOrder {
                    expected: summary.version + 1,
                    received: delta.version,
                });
            }

            if queue.has(&delta.id) {
                if acknowledged.insert(delta.id.clone()) {
                    summary.acknowledged.push(delta.id.clone());
                }
            } else {
                applicable.push(delta.to_delta());
            }

            summary.version = delta.version;
        }

        summary.remote_applied = applicable.len();

        let pending = queue
            .iter()
            .filter(|delta| !acknowledged.contains(&delta.id))
            .cloned();
        applicable.extend(pending);
        summary.local_reapplied = applicable.len() - summary.remote_applied;

        let mut elements = scene.elements();
        for delta in &applicable {
            scene
                .apply_delta(delta, &mut elements)
                .map_err(|source| ReconcileFault::Apply {
                    delta_id: delta.id.clone(),
                    source,
                })?;
        }

        Ok(PreparedBatch {
            elements,
            applied: !applicable.is_empty(),
            summary,
        })
    }
}
