use std::fmt::Debug;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use crate::firestore::core::{TargetData, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{ListenSequenceNumber, PersistenceTransaction};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::{remote_document_cache, target_cache};
use crate::firestore::model::DocumentKey;

/// Policy hooks invoked whenever a document gains or loses a reference.
///
/// The eager delegate deletes unreferenced documents at the end of every transaction. The
/// LRU delegate only records when each document was last used and leaves deletion to
/// [`LruGarbageCollector`](crate::firestore::local::LruGarbageCollector).
pub trait ReferenceDelegate: Send + Sync + Debug {
    fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    /// Called when a target is released without keeping its persisted data.
    fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()>;

    /// Called when a mutation batch touching `key` leaves the queue.
    fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()>;

    /// Documents pinned by local views. Never collected while pinned.
    fn in_memory_pins(&self) -> &StdMutex<ReferenceSet>;

    fn as_lru(&self) -> Option<&LruReferenceDelegate> {
        None
    }
}

pub(crate) fn lock_pins(pins: &StdMutex<ReferenceSet>) -> MutexGuard<'_, ReferenceSet> {
    pins.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct EagerReferenceDelegate {
    in_memory_pins: StdMutex<ReferenceSet>,
}

impl EagerReferenceDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_referenced(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        txn.database.target_documents_contain_key(key)
            || txn.database.mutation_queues_contain_key(key)
            || lock_pins(&self.in_memory_pins).contains_key(key)
    }
}

impl ReferenceDelegate for EagerReferenceDelegate {
    fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.orphaned_documents.remove(key);
        Ok(())
    }

    fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.orphaned_documents.insert(key.clone());
        Ok(())
    }

    fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        if let Some(keys) = txn.database.target_documents.get(&target_data.target_id) {
            txn.orphaned_documents.extend(keys.keys().cloned());
        }
        target_cache::delete_target(txn.database, target_data.target_id);
        Ok(())
    }

    fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.orphaned_documents.insert(key.clone());
        Ok(())
    }

    fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.orphaned_documents.insert(key.clone());
        Ok(())
    }

    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let candidates = std::mem::take(&mut txn.orphaned_documents);
        for key in candidates {
            if !self.is_referenced(txn, &key) {
                remote_document_cache::delete_entry(txn.database, &key);
                txn.database.document_sequence_numbers.remove(&key);
            }
        }
        Ok(())
    }

    fn in_memory_pins(&self) -> &StdMutex<ReferenceSet> {
        &self.in_memory_pins
    }
}

/// Records "last used" sequence numbers so that LRU collection can evict cold data.
#[derive(Debug, Default)]
pub struct LruReferenceDelegate {
    in_memory_pins: StdMutex<ReferenceSet>,
}

impl LruReferenceDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_sentinel_key(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        let sequence_number = txn.current_sequence_number();
        txn.database
            .document_sequence_numbers
            .insert(key.clone(), sequence_number);
    }

    fn is_pinned(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        lock_pins(&self.in_memory_pins).contains_key(key)
            || txn.database.mutation_queues_contain_key(key)
    }

    /// Number of targets plus orphaned documents: the population LRU percentiles refer to.
    pub fn sequence_number_count(&self, txn: &PersistenceTransaction<'_>) -> usize {
        txn.database.targets.len() + self.orphaned_documents(txn).len()
    }

    /// Documents outside every target, with the sequence number they were last used at.
    pub fn orphaned_documents(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> Vec<(DocumentKey, ListenSequenceNumber)> {
        txn.database
            .document_sequence_numbers
            .iter()
            .filter(|(key, _)| !txn.database.target_documents_contain_key(key))
            .map(|(key, sequence_number)| (key.clone(), *sequence_number))
            .collect()
    }

    pub fn target_sequence_numbers(&self, txn: &PersistenceTransaction<'_>) -> Vec<ListenSequenceNumber> {
        txn.database
            .targets
            .values()
            .map(|data| data.sequence_number)
            .collect()
    }

    /// Removes orphaned documents last used at or before `upper_bound` that nothing pins.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.orphaned_documents(txn) {
            if sequence_number > upper_bound || self.is_pinned(txn, &key) {
                continue;
            }
            remote_document_cache::delete_entry(txn.database, &key);
            txn.database.document_sequence_numbers.remove(&key);
            removed += 1;
        }
        Ok(removed)
    }

    pub fn byte_size(&self, txn: &PersistenceTransaction<'_>) -> i64 {
        txn.database.remote_document_size
    }
}

impl ReferenceDelegate for LruReferenceDelegate {
    fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel_key(txn, key);
        Ok(())
    }

    fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel_key(txn, key);
        Ok(())
    }

    fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number();
        if let Some(stored) = txn.database.targets.get_mut(&target_data.target_id) {
            stored.sequence_number = sequence_number;
        }
        Ok(())
    }

    fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel_key(txn, key);
        Ok(())
    }

    fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel_key(txn, key);
        Ok(())
    }

    fn on_transaction_committed(&self, _txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        Ok(())
    }

    fn in_memory_pins(&self) -> &StdMutex<ReferenceSet> {
        &self.in_memory_pins
    }

    fn as_lru(&self) -> Option<&LruReferenceDelegate> {
        Some(self)
    }
}
