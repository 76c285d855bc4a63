use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::{Target, TargetData, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{ListenSequenceNumber, PersistenceTransaction};
use crate::firestore::local::schema::LocalDatabase;
use crate::firestore::local::ReferenceDelegate;
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};
use crate::util::hard_assert;

/// Persisted targets, the documents each of them matched, and global target metadata.
#[derive(Clone, Debug)]
pub struct TargetCache {
    reference_delegate: Arc<dyn ReferenceDelegate>,
}

impl TargetCache {
    pub fn new(reference_delegate: Arc<dyn ReferenceDelegate>) -> Self {
        Self { reference_delegate }
    }

    /// Hands out the next target id. Ids are even and start at 2.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> TargetId {
        let global = &mut txn.database.target_global;
        let next = next_even_id(global.highest_target_id);
        global.highest_target_id = next;
        next
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> SnapshotVersion {
        txn.database.target_global.last_remote_snapshot_version
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> ListenSequenceNumber {
        txn.database.target_global.highest_listen_sequence_number
    }

    pub fn set_targets_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        let global = &mut txn.database.target_global;
        global.highest_listen_sequence_number = global
            .highest_listen_sequence_number
            .max(highest_listen_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            global.last_remote_snapshot_version = version;
        }
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        self.save_target_data(txn, target_data);
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        self.save_target_data(txn, target_data);
    }

    /// Deletes the target together with its matching keys.
    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.database.targets.remove(&target_data.target_id);
        Ok(())
    }

    /// Removes every target last used at or before `upper_bound` that is not listed in
    /// `active_target_ids`. Document sequence numbers are left alone.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetId> = txn
            .database
            .targets
            .values()
            .filter(|data| data.sequence_number <= upper_bound)
            .filter(|data| !active_target_ids.contains(&data.target_id))
            .map(|data| data.target_id)
            .collect();
        for target_id in &doomed {
            delete_target(txn.database, *target_id);
        }
        doomed.len()
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_>) -> usize {
        txn.database.targets.len()
    }

    pub fn for_each_target(&self, txn: &PersistenceTransaction<'_>, mut f: impl FnMut(&TargetData)) {
        txn.database.targets.values().for_each(|data| f(data));
    }

    /// Looks a target up by canonical id.
    pub fn get_target_data(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<TargetData> {
        let canonical_id = target.canonical_id();
        txn.database
            .targets
            .values()
            .find(|data| data.target.canonical_id() == canonical_id && data.target == *target)
            .cloned()
    }

    pub fn get_target_data_for_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> Option<TargetData> {
        txn.database.targets.get(&target_id).cloned()
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.database
                .target_documents
                .entry_or_default(target_id)
                .insert(key.clone(), ());
            self.reference_delegate.add_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            remove_target_document(txn.database, target_id, key);
            self.reference_delegate.remove_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let keys = self.get_matching_keys_for_target_id(txn, target_id);
        self.remove_matching_keys(txn, &keys, target_id)
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> DocumentKeySet {
        txn.database
            .target_documents
            .get(&target_id)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any target matches `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        txn.database.target_documents_contain_key(key)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        let database = &mut *txn.database;
        database
            .targets
            .insert(target_data.target_id, target_data.clone());
        let global = &mut database.target_global;
        global.highest_target_id = global.highest_target_id.max(target_data.target_id);
        global.highest_listen_sequence_number = global
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
    }
}

fn next_even_id(highest: TargetId) -> TargetId {
    let candidate = highest + 2;
    hard_assert(candidate > 0, "Target id space exhausted");
    candidate - candidate % 2
}

fn remove_target_document(database: &mut LocalDatabase, target_id: TargetId, key: &DocumentKey) {
    if let Some(keys) = database.target_documents.get_mut(&target_id) {
        keys.remove(key);
        if keys.is_empty() {
            database.target_documents.remove(&target_id);
        }
    }
}

/// Drops a target and its matched keys without notifying the reference delegate.
pub(crate) fn delete_target(database: &mut LocalDatabase, target_id: TargetId) {
    database.targets.remove(&target_id);
    database.target_documents.remove(&target_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, TargetPurpose};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::{EagerReferenceDelegate, LruReferenceDelegate};
    use crate::firestore::model::ResourcePath;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn target(path: &str) -> Target {
        Query::new(ResourcePath::from_string(path).unwrap()).to_target()
    }

    fn cache() -> TargetCache {
        TargetCache::new(Arc::new(LruReferenceDelegate::new()))
    }

    #[test]
    fn target_ids_are_even_and_increasing() {
        let cache = cache();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        assert_eq!(cache.allocate_target_id(&mut txn), 2);
        assert_eq!(cache.allocate_target_id(&mut txn), 4);

        let data = TargetData::new(target("rooms"), 9, TargetPurpose::Listen, 1);
        cache.add_target_data(&mut txn, &data);
        assert_eq!(cache.allocate_target_id(&mut txn), 10);
    }

    #[test]
    fn looks_targets_up_by_canonical_id() {
        let cache = cache();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 3);
        cache.add_target_data(&mut txn, &data);

        assert_eq!(cache.get_target_data(&txn, &target("rooms")), Some(data.clone()));
        assert!(cache.get_target_data(&txn, &target("halls")).is_none());
        assert_eq!(cache.get_target_count(&txn), 1);
        assert_eq!(cache.get_highest_sequence_number(&txn), 3);
    }

    #[test]
    fn matching_keys_stamp_sequence_numbers() {
        let cache = cache();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 5);
        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.add_matching_keys(&mut txn, &keys, 2).unwrap();
        assert!(cache.contains_key(&txn, &key("rooms/a")));
        assert_eq!(cache.get_matching_keys_for_target_id(&txn, 2).len(), 2);

        cache.remove_matching_keys_for_target_id(&mut txn, 2).unwrap();
        assert!(!cache.contains_key(&txn, &key("rooms/a")));
        assert_eq!(database.document_sequence_numbers[&key("rooms/b")], 5);
    }

    #[test]
    fn remove_targets_skips_active_and_recent_targets() {
        let cache = TargetCache::new(Arc::new(EagerReferenceDelegate::new()));
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 9);
        for (id, sequence_number) in [(2, 1), (4, 2), (6, 8)] {
            let data = TargetData::new(target(&format!("c{id}")), id, TargetPurpose::Listen, sequence_number);
            cache.add_target_data(&mut txn, &data);
            let keys: DocumentKeySet = [key(&format!("c{id}/doc"))].into_iter().collect();
            cache.add_matching_keys(&mut txn, &keys, id).unwrap();
        }
        let active: BTreeSet<TargetId> = [4].into_iter().collect();
        assert_eq!(cache.remove_targets(&mut txn, 5, &active), 1);
        assert!(cache.get_target_data_for_id(&txn, 2).is_none());
        assert!(!cache.contains_key(&txn, &key("c2/doc")));
        assert!(cache.get_target_data_for_id(&txn, 6).is_some());
    }
}
