//! Per-element merge for relayed changes.
//!
//! Relays carry ephemeral element snapshots (cursor-adjacent edits, live
//! drags). They bypass the queue and the version-ordered reconciliation;
//! each element is merged on its own version alone.
//!
//! # Merge Rule
//!
//! | Local element | Relayed element | Result |
//! |---------------|-----------------|--------|
//! | absent | any | relayed |
//! | version `a` | version `b > a` | relayed |
//! | version `a` | version `b <= a` | local |

use crate::scene::{Change, ElementMap};

/// Merge a relayed change into `elements`.
///
/// Returns the ids of the elements that were taken from the relay.
pub fn merge_relayed(elements: &mut ElementMap, change: &Change) -> Vec<String> {
    let mut taken = Vec::new();

    for (id, relayed) in &change.elements {
        let newer = elements
            .get(id)
            .map_or(true, |existing| existing.version < relayed.version);

        if newer {
            elements.insert(id.clone(), relayed.clone());
            taken.push(id.clone());
        }
    }

    taken
}
