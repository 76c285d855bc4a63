use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::TargetId;
use crate::firestore::model::{DocumentKey, DocumentKeySet};

/// In-memory many-to-many set of (document key, target id) references.
///
/// Tracks the documents currently shown by local views so garbage collection leaves them
/// alone.
#[derive(Debug, Default, Clone)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    by_target: BTreeMap<TargetId, DocumentKeySet>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, target_id: TargetId) {
        self.by_key
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.by_target.entry(target_id).or_default().insert(key);
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys {
            self.add_reference(key.clone(), target_id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&target_id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_target.get_mut(&target_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_target.remove(&target_id);
            }
        }
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys {
            self.remove_reference(key, target_id);
        }
    }

    /// Drops every reference held by `target_id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, target_id: TargetId) -> DocumentKeySet {
        let keys = self.by_target.remove(&target_id).unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&target_id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn references_for_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.by_target.get(&target_id).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_per_target() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("c/a"), 1);
        set.add_reference(key("c/a"), 2);
        set.add_reference(key("c/b"), 2);

        set.remove_reference(&key("c/a"), 1);
        assert!(set.contains_key(&key("c/a")));

        let removed = set.remove_references_for_id(2);
        assert_eq!(removed.len(), 2);
        assert!(!set.contains_key(&key("c/a")));
        assert!(set.is_empty());
    }
}
