//! Delta records exchanged with the room authority.
//!
//! A [`Delta`] is an atomic, idempotent and invertible change to the scene.
//! Its payload is opaque here; only the [`Scene`](crate::scene::Scene)
//! collaborator interprets it. Once the server commits a delta it assigns a
//! version, producing an [`AcknowledgedDelta`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated, globally unique delta identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaId(String);

impl DeltaId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeltaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeltaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for DeltaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A locally authored change to the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    /// Unique identifier
    pub id: DeltaId,
    /// Scene-specific change payload
    pub payload: serde_json::Value,
    /// Local creation time; an ordering hint, never authoritative
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Delta {
    /// Create a delta with a freshly generated id.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self::with_id(DeltaId::generate(), payload)
    }

    /// Create a delta with a known id.
    #[must_use]
    pub fn with_id(id: impl Into<DeltaId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A delta the server committed at a given version.
///
/// Versions are strictly increasing and gapless within a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgedDelta {
    /// Id of the delta as authored by its client
    pub id: DeltaId,
    /// Server-assigned version
    pub version: u64,
    /// Scene-specific change payload
    pub payload: serde_json::Value,
}

impl AcknowledgedDelta {
    /// Create an acknowledged delta.
    #[must_use]
    pub fn new(id: impl Into<DeltaId>, version: u64, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            version,
            payload,
        }
    }

    /// Acknowledge a local delta at the given version.
    #[must_use]
    pub fn from_delta(delta: &Delta, version: u64) -> Self {
        Self::new(delta.id.clone(), version, delta.payload.clone())
    }

    /// View this record as an applicable delta.
    #[must_use]
    pub fn to_delta(&self) -> Delta {
        Delta::with_id(self.id.clone(), self.payload.clone())
    }
}
