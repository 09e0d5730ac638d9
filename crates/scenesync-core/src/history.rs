//! Bounded record of acknowledged deltas.
//!
//! Answers "what changed since version N" for the retained window. Once the
//! retention cap is reached the lowest versions are evicted first.

use crate::delta::AcknowledgedDelta;
use std::collections::BTreeMap;

/// Default number of acknowledged deltas kept per session.
pub const DEFAULT_RETENTION: usize = 10_000;

/// Version-ordered history of acknowledged deltas.
#[derive(Debug, Clone)]
pub struct AckHistory {
    entries: BTreeMap<u64, AcknowledgedDelta>,
    retention: usize,
}

impl Default for AckHistory {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl AckHistory {
    /// Create a history keeping at most `retention` entries.
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            retention,
        }
    }

    /// Record an acknowledged delta; re-recording a version overwrites it.
    pub fn record(&mut self, delta: AcknowledgedDelta) {
        self.entries.insert(delta.version, delta);

        while self.entries.len() > self.retention {
            if let Some((evicted, _)) = self.entries.pop_first() {
                tracing::trace!(version = evicted, "Evicted acknowledged delta");
            }
        }
    }

    /// Retained deltas with a version greater than `version`, ascending.
    pub fn since(&self, version: u64) -> impl Iterator<Item = &AcknowledgedDelta> {
        self.entries
            .range((std::ops::Bound::Excluded(version), std::ops::Bound::Unbounded))
            .map(|(_, delta)| delta)
    }

    /// All retained deltas, ascending by version.
    pub fn iter(&self) -> impl Iterator<Item = &AcknowledgedDelta> {
        self.entries.values()
    }

    /// Lowest retained version.
    #[must_use]
    pub fn oldest_version(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    /// Get the number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
