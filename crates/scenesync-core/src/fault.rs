//! Faults surfaced to the host's error-reporting collaborator.

use crate::delta::DeltaId;
use crate::reconcile::ReconcileFault;

/// A sync problem worth telling the host about.
///
/// None of these are fatal; the engine has already recovered (or scheduled
/// recovery) by the time a fault is reported.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncFault {
    /// A batch was discarded and a full resync was scheduled
    #[error("resynchronizing after inconsistent batch: {0}")]
    Resync(ReconcileFault),
    /// The server refused some of our deltas; they were dropped and reverted
    #[error("server rejected {} delta(s): {message}", .ids.len())]
    Rejected {
        /// Rejected delta ids that were still queued
        ids: Vec<DeltaId>,
        /// Server-provided reason
        message: String,
    },
}

/// Receives [`SyncFault`]s.
pub trait ErrorSink: Send {
    /// Report a fault.
    fn report(&self, fault: &SyncFault);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, fault: &SyncFault) {
        match fault {
            SyncFault::Resync(_) => tracing::warn!(error = %fault, "Sync fault"),
            SyncFault::Rejected { ids, .. } => {
                tracing::error!(error = %fault, rejected = ids.len(), "Deltas rejected by server");
            }
        }
    }
}
