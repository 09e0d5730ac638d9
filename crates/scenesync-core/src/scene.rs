//! Scene collaborator interface and a reference element scene.
//!
//! The sync engine never interprets delta payloads itself. It borrows the
//! current elements from a [`Scene`], asks the scene to apply deltas to a
//! working copy, and publishes the copy back only when a whole batch
//! succeeded.
//!
//! [`SharedScene`] with [`SceneDelta`] payloads is the reference
//! implementation used by the client binary and the tests:
//! - Elements are keyed by id and carry a per-element version
//! - A `SceneDelta` records `from`/`to` states per element, so applying it
//!   is idempotent and inverting it is a swap

use crate::delta::Delta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A single scene element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Element identifier
    pub id: String,
    /// Per-element version, bumped on every local mutation
    pub version: u64,
    /// Soft-deletion marker
    #[serde(default)]
    pub is_deleted: bool,
    /// Remaining element properties (geometry, style, ...)
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Element {
    /// Create an element without properties.
    #[must_use]
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
            is_deleted: false,
            properties: serde_json::Map::new(),
        }
    }

    /// Set a property, returning the element.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Scene snapshot: elements by id, including deleted ones.
pub type ElementMap = BTreeMap<String, Element>;

/// Ephemeral relay payload carrying changed elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Changed elements by id
    pub elements: ElementMap,
}

impl Change {
    /// Build a change from a list of elements.
    #[must_use]
    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        Self {
            elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }
}

/// Before/after state of one element within a [`SceneDelta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementUpdate {
    /// State before the change (`None` when the element was created)
    #[serde(default)]
    pub from: Option<Element>,
    /// State after the change (`None` when the element was removed)
    #[serde(default)]
    pub to: Option<Element>,
}

/// Payload format understood by [`SharedScene`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDelta {
    /// Updates by element id
    pub elements: BTreeMap<String, ElementUpdate>,
}

impl SceneDelta {
    /// Create an empty scene delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insert or update of `next`.
    #[must_use]
    pub fn upsert(mut self, previous: Option<Element>, next: Element) -> Self {
        self.elements.insert(
            next.id.clone(),
            ElementUpdate {
                from: previous,
                to: Some(next),
            },
        );
        self
    }

    /// Record a hard removal of `previous`.
    #[must_use]
    pub fn remove(mut self, previous: Element) -> Self {
        self.elements.insert(
            previous.id.clone(),
            ElementUpdate {
                from: Some(previous),
                to: None,
            },
        );
        self
    }

    /// Check if the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Apply the `to` states to `elements`.
    ///
    /// The delta is validated before anything is written, so a rejected delta
    /// leaves `elements` untouched.
    ///
    /// # Errors
    ///
    /// Returns error if an update names a different element than its key.
    pub fn apply_to(&self, elements: &mut ElementMap) -> Result<(), ApplyError> {
        for (id, update) in &self.elements {
            for state in [&update.from, &update.to].into_iter().flatten() {
                if &state.id != id {
                    return Err(ApplyError::Rejected(format!(
                        "update for element '{id}' carries element '{}'",
                        state.id
                    )));
                }
            }
        }

        for (id, update) in &self.elements {
            match &update.to {
                Some(element) => {
                    elements.insert(id.clone(), element.clone());
                }
                None => {
                    elements.remove(id);
                }
            }
        }

        Ok(())
    }

    /// The delta that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let elements = self
            .elements
            .iter()
            .map(|(id, update)| {
                (
                    id.clone(),
                    ElementUpdate {
                        from: update.to.clone(),
                        to: update.from.clone(),
                    },
                )
            })
            .collect();

        Self { elements }
    }

    /// Decode from a delta payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a scene delta.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, ApplyError> {
        Self::deserialize(payload).map_err(|e| ApplyError::Payload(e.to_string()))
    }

    /// Encode as a delta payload.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_payload(&self) -> Result<serde_json::Value, ApplyError> {
        serde_json::to_value(self).map_err(|e| ApplyError::Payload(e.to_string()))
    }
}

/// The scene collaborator the sync engine works against.
pub trait Scene {
    /// Current elements, including deleted ones.
    fn elements(&self) -> ElementMap;

    /// Apply `delta` to a working copy of the elements.
    ///
    /// # Errors
    ///
    /// Returns error if the scene cannot apply the delta.
    fn apply_delta(&self, delta: &Delta, elements: &mut ElementMap) -> Result<(), ApplyError>;

    /// Undo `delta` on a working copy of the elements.
    ///
    /// # Errors
    ///
    /// Returns error if the scene cannot invert the delta.
    fn revert_delta(&self, delta: &Delta, elements: &mut ElementMap) -> Result<(), ApplyError>;

    /// Publish a new snapshot.
    fn replace_elements(&mut self, elements: ElementMap);
}

/// Errors raised by a [`Scene`] when applying deltas.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    /// The payload could not be decoded
    #[error("malformed delta payload: {0}")]
    Payload(String),
    /// The scene refused the delta
    #[error("delta rejected by scene: {0}")]
    Rejected(String),
}

/// A cloneable, lock-protected element scene.
///
/// Clones share the same elements, so the host can read the scene while a
/// sync session owns another handle to it.
#[derive(Debug, Clone, Default)]
pub struct SharedScene {
    elements: Arc<Mutex<ElementMap>>,
}

impl SharedScene {
    /// Create an empty scene.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scene holding the given elements.
    #[must_use]
    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        let elements = elements.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            elements: Arc::new(Mutex::new(elements)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ElementMap> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current elements.
    #[must_use]
    pub fn snapshot(&self) -> ElementMap {
        self.lock().clone()
    }

    /// Get an element by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Element> {
        self.lock().get(id).cloned()
    }

    /// Get the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the scene is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply a local edit and wrap it as a delta ready to be pushed.
    ///
    /// # Errors
    ///
    /// Returns error if the edit cannot be applied or encoded.
    pub fn apply_local(&self, change: &SceneDelta) -> Result<Delta, ApplyError> {
        let payload = change.to_payload()?;
        change.apply_to(&mut self.lock())?;

        let delta = Delta::new(payload);
        tracing::debug!(
            delta_id = %delta.id,
            elements = change.elements.len(),
            "Applied local scene delta"
        );
        Ok(delta)
    }
}

impl Scene for SharedScene {
    fn elements(&self) -> ElementMap {
        self.snapshot()
    }

    fn apply_delta(&self, delta: &Delta, elements: &mut ElementMap) -> Result<(), ApplyError> {
        SceneDelta::from_payload(&delta.payload)?.apply_to(elements)
    }

    fn revert_delta(&self, delta: &Delta, elements: &mut ElementMap) -> Result<(), ApplyError> {
        SceneDelta::from_payload(&delta.payload)?
            .inverse()
            .apply_to(elements)
    }

    fn replace_elements(&mut self, elements: ElementMap) {
        *self.lock() = elements;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(id: &str, version: u64, x: i64) -> Element {
        Element::new(id, version).with_property("x", serde_json::json!(x))
    }

    #[test]
    fn element_properties_are_flattened() {
        let element = rect("r1", 3, 10);
        let value = serde_json::to_value(&element).unwrap();

        assert_eq!(value["id"], "r1");
        assert_eq!(value["version"], 3);
        assert_eq!(value["isDeleted"], false);
        assert_eq!(value["x"], 10);
    }

    #[test]
    fn scene_delta_apply_is_idempotent() {
        let delta = SceneDelta::new().upsert(None, rect("r1", 1, 5));
        let mut elements = ElementMap::new();

        delta.apply_to(&mut elements).unwrap();
        let once = elements.clone();
        delta.apply_to(&mut elements).unwrap();

        assert_eq!(elements, once);
        assert_eq!(elements["r1"].version, 1);
    }

    #[test]
    fn scene_delta_inverse_restores_previous_state() {
        let before = rect("r1", 1, 5);
        let mut elements: ElementMap = [("r1".to_string(), before.clone())].into();
        let original = elements.clone();

        let delta = SceneDelta::new()
            .upsert(Some(before.clone()), rect("r1", 2, 9))
            .upsert(None, rect("r2", 1, 0));
        delta.apply_to(&mut elements).unwrap();
        assert_eq!(elements.len(), 2);

        delta.inverse().apply_to(&mut elements).unwrap();
        assert_eq!(elements, original);
    }

    #[test]
    fn scene_delta_with_mismatched_id_is_rejected_untouched() {
        let mut delta = SceneDelta::new().upsert(None, rect("r1", 1, 5));
        delta.elements.insert(
            "r2".to_string(),
            ElementUpdate {
                from: None,
                to: Some(rect("other", 1, 0)),
            },
        );

        let mut elements = ElementMap::new();
        let err = delta.apply_to(&mut elements).unwrap_err();

        assert!(matches!(err, ApplyError::Rejected(_)));
        assert!(elements.is_empty());
    }

    #[test]
    fn shared_scene_apply_local_produces_pushable_delta() {
        let scene = SharedScene::new();
        let delta = scene
            .apply_local(&SceneDelta::new().upsert(None, rect("r1", 1, 5)))
            .unwrap();

        assert_eq!(scene.len(), 1);

        let mut elements = ElementMap::new();
        scene.apply_delta(&delta, &mut elements).unwrap();
        assert_eq!(elements, scene.snapshot());

        scene.revert_delta(&delta, &mut elements).unwrap();
        assert!(elements.is_empty());
    }

    #[test]
    fn shared_scene_clones_share_elements() {
        let scene = SharedScene::new();
        let mut other = scene.clone();

        other.replace_elements([("r1".to_string(), rect("r1", 1, 1))].into());
        assert_eq!(scene.get("r1").map(|e| e.version), Some(1));
    }

    #[test]
    fn malformed_payload_is_reported() {
        let scene = SharedScene::new();
        let delta = Delta::with_id("bad", serde_json::json!({"elements": 42}));

        let err = scene
            .apply_delta(&delta, &mut ElementMap::new())
            .unwrap_err();
        assert!(matches!(err, ApplyError::Payload(_)));
    }
}
