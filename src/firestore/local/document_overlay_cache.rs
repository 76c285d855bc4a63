use std::collections::BTreeMap;

use crate::firestore::core::User;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, DocumentKeySet, Mutation, Overlay, ResourcePath};

pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// Per-identity cache of the overlay mutation for each locally modified document.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key(),
        }
    }

    fn overlays<'t>(&self, txn: &'t PersistenceTransaction<'_>) -> Option<&'t OverlayMap> {
        txn.database
            .overlays
            .get(&self.user_key)
            .map(|overlays| &**overlays)
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Option<Overlay> {
        self.overlays(txn).and_then(|overlays| overlays.get(key)).cloned()
    }

    pub fn get_overlays(&self, txn: &PersistenceTransaction<'_>, keys: &DocumentKeySet) -> OverlayMap {
        keys.iter()
            .filter_map(|key| self.get_overlay(txn, key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    /// Stores `overlays`, all tagged with `largest_batch_id`, replacing previous ones.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) {
        let stored = txn.database.overlays.entry_or_default(self.user_key.clone());
        for (key, mutation) in overlays {
            stored.insert(key.clone(), Overlay::new(largest_batch_id, mutation.clone()));
        }
    }

    /// Removes the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
        batch_id: BatchId,
    ) {
        let Some(stored) = txn.database.overlays.get_mut(&self.user_key) else {
            return;
        };
        for key in keys {
            if stored
                .get(key)
                .is_some_and(|overlay| overlay.largest_batch_id == batch_id)
            {
                stored.remove(key);
            }
        }
    }

    /// Overlays of documents directly inside `collection` written after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        self.overlays(txn)
            .map(|overlays| {
                overlays
                    .iter()
                    .filter(|(key, overlay)| {
                        collection.is_immediate_parent_of(key.path())
                            && overlay.largest_batch_id > since_batch_id
                    })
                    .map(|(key, overlay)| (key.clone(), overlay.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overlays in the collection group written after `since_batch_id`, in batch order.
    ///
    /// Returns whole batches until at least `count` overlays were collected, so the result
    /// may be larger than `count`.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> OverlayMap {
        let Some(overlays) = self.overlays(txn) else {
            return OverlayMap::new();
        };
        let mut by_batch: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        for overlay in overlays.values() {
            if overlay.key().has_collection_id(collection_group)
                && overlay.largest_batch_id > since_batch_id
            {
                by_batch
                    .entry(overlay.largest_batch_id)
                    .or_default()
                    .push(overlay);
            }
        }

        let mut result = OverlayMap::new();
        for batch in by_batch.into_values() {
            for overlay in batch {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::schema::LocalDatabase;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths
            .iter()
            .map(|path| (key(path), Mutation::set(key(path), MapValue::empty())))
            .collect()
    }

    #[test]
    fn saves_and_removes_by_batch() {
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache.save_overlays(&mut txn, 1, &overlays(&["c/a", "c/b"]));
        cache.save_overlays(&mut txn, 2, &overlays(&["c/b"]));
        assert_eq!(cache.get_overlay(&txn, &key("c/b")).unwrap().largest_batch_id, 2);

        let keys: DocumentKeySet = [key("c/a"), key("c/b")].into_iter().collect();
        cache.remove_overlays_for_batch_id(&mut txn, &keys, 1);
        assert!(cache.get_overlay(&txn, &key("c/a")).is_none());
        assert!(cache.get_overlay(&txn, &key("c/b")).is_some());
        assert_eq!(cache.get_overlays(&txn, &keys).len(), 1);
    }

    #[test]
    fn overlays_are_namespaced_per_identity() {
        let anonymous = DocumentOverlayCache::new(&User::unauthenticated());
        let alice = DocumentOverlayCache::new(&User::authenticated("alice"));
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        anonymous.save_overlays(&mut txn, 1, &overlays(&["c/a"]));
        assert!(alice.get_overlay(&txn, &key("c/a")).is_none());
    }

    #[test]
    fn collection_reads_filter_by_batch_id() {
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache.save_overlays(&mut txn, 1, &overlays(&["c/a", "c/a/sub/x"]));
        cache.save_overlays(&mut txn, 3, &overlays(&["c/b"]));

        let collection = ResourcePath::from_string("c").unwrap();
        assert_eq!(cache.get_overlays_for_collection(&txn, &collection, -1).len(), 2);
        assert_eq!(cache.get_overlays_for_collection(&txn, &collection, 1).len(), 1);
    }

    #[test]
    fn collection_group_reads_never_split_batches() {
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache.save_overlays(&mut txn, 1, &overlays(&["c/a", "x/y/c/b", "c/c"]));
        cache.save_overlays(&mut txn, 2, &overlays(&["c/d"]));

        let first = cache.get_overlays_for_collection_group(&txn, "c", -1, 1);
        assert_eq!(first.len(), 3);
        let rest = cache.get_overlays_for_collection_group(&txn, "c", 1, 1);
        assert_eq!(rest.keys().cloned().collect::<Vec<_>>(), vec![key("c/d")]);
    }
}
