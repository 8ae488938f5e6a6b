//! Diff accumulators between watch events and route compilation.
//!
//! Watch handlers record, per object, the fragment derived from the object
//! before and after each event. Fragments are only compared, never applied, so
//! handlers stay cheap. The compiler later checks out all pending changes and
//! applies them to its canonical maps in one step:
//!
//! ```text
//! [ watch ] --update(prev, curr)--> [ ChangeTracker ] --checkout()--> [ canonical map ]
//! ```
//!
//! An object whose fragment returns to the value it had at the last checkout
//! is dropped from the tracker, so a burst of no-op updates never triggers a
//! publish.

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{collections::BTreeMap, hash::Hash};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Service,
    Endpoints,
    Ingress,
    ServiceImport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change<V> {
    pub kind: Kind,
    pub previous: Option<V>,
    pub current: Option<V>,
}

#[derive(Debug)]
pub struct ChangeTracker<K, V> {
    kind: Kind,
    items: Mutex<HashMap<K, Change<V>>>,
}

// === impl ChangeTracker ===

impl<K, V> ChangeTracker<K, V>
where
    K: Clone + Eq + Hash,
    V: PartialEq,
{
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Records that the fragment for `key` moved from `previous` to `current`.
    ///
    /// Returns true if any change is pending.
    pub fn update(&self, key: K, previous: Option<V>, current: Option<V>) -> bool {
        let kind = self.kind;
        let mut items = self.items.lock();
        let change = items.entry(key.clone()).or_insert_with(|| Change {
            kind,
            previous,
            current: None,
        });
        change.current = current;
        if change.previous == change.current {
            items.remove(&key);
        }
        !items.is_empty()
    }

    /// Takes all pending changes, leaving the tracker empty.
    pub fn checkout(&self) -> Vec<Change<V>> {
        std::mem::take(&mut *self.items.lock())
            .into_values()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Applies checked-out changes to a canonical map: every key of a previous
/// fragment is removed before the keys of the current fragment are inserted.
pub fn apply_changes<K, T>(map: &mut BTreeMap<K, T>, changes: Vec<Change<BTreeMap<K, T>>>)
where
    K: Ord,
{
    for Change {
        previous, current, ..
    } in changes
    {
        for key in previous.into_iter().flat_map(|p| p.into_keys()) {
            map.remove(&key);
        }
        if let Some(current) = current {
            map.extend(current);
        }
    }
}
