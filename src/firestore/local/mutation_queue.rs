use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::firestore::core::{Query, User};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::MutationQueueRecord;
use crate::firestore::local::{IndexManager, ReferenceDelegate};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp, BATCHID_UNKNOWN,
};
use crate::util::hard_assert;

/// Durable, per-identity log of local writes that the backend has not acknowledged yet.
///
/// Batches are always returned in increasing batch id order.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
    index_manager: IndexManager,
    reference_delegate: Arc<dyn ReferenceDelegate>,
    /// Keys of batches looked up by id, kept for secondary processes catching up on writes
    /// made by the primary.
    keys_by_batch_id: Arc<Mutex<BTreeMap<BatchId, DocumentKeySet>>>,
}

impl MutationQueue {
    pub fn new(
        user: &User,
        index_manager: IndexManager,
        reference_delegate: Arc<dyn ReferenceDelegate>,
    ) -> Self {
        Self {
            user_key: user.storage_key(),
            index_manager,
            reference_delegate,
            keys_by_batch_id: Arc::default(),
        }
    }

    fn queue<'t>(&self, txn: &'t PersistenceTransaction<'_>) -> Option<&'t MutationQueueRecord> {
        txn.database.mutation_queues.get(&self.user_key)
    }

    fn queue_mut<'t>(&self, txn: &'t mut PersistenceTransaction<'_>) -> &'t mut MutationQueueRecord {
        txn.database
            .mutation_queues
            .entry_or_default(self.user_key.clone())
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> bool {
        self.queue(txn).map_or(true, |queue| queue.batches.is_empty())
    }

    /// Appends a batch under the next global batch id.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = txn.database.last_batch_id + 1;
        txn.database.last_batch_id = batch_id;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);

        let queue = self.queue_mut(txn);
        queue.batches.insert(batch_id, batch.clone());
        for mutation in &batch.mutations {
            queue
                .document_mutations
                .entry_or_default(mutation.key().clone())
                .insert(batch_id);
        }
        for mutation in &batch.mutations {
            self.index_manager
                .add_to_collection_parent_index(txn, &mutation.key().collection_path());
        }
        batch
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.queue(txn)
            .and_then(|queue| queue.batches.get(&batch_id))
            .cloned()
    }

    /// Keys written by batch `batch_id`, remembered after the first lookup. `None` when the
    /// batch is not queued (anymore).
    pub fn lookup_mutation_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<DocumentKeySet> {
        let mut cached = self
            .keys_by_batch_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = cached.get(&batch_id) {
            return Some(keys.clone());
        }
        let keys = self.lookup_mutation_batch(txn, batch_id)?.keys();
        cached.insert(batch_id, keys.clone());
        Some(keys)
    }

    /// Drops the keys remembered by [`lookup_mutation_keys`](Self::lookup_mutation_keys).
    pub fn remove_cached_mutation_keys(&self, batch_id: BatchId) {
        self.keys_by_batch_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&batch_id);
    }

    /// First queued batch whose id is greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.queue(txn).and_then(|queue| {
            queue
                .batches
                .range(batch_id.saturating_add(1)..)
                .next()
                .map(|(_, batch)| batch.clone())
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> BatchId {
        self.queue(txn)
            .and_then(|queue| queue.batches.keys().next_back().copied())
            .unwrap_or(BATCHID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> Vec<MutationBatch> {
        self.queue(txn)
            .map(|queue| queue.batches.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let keys: DocumentKeySet = [key.clone()].into_iter().collect();
        self.get_all_mutation_batches_affecting_document_keys(txn, &keys)
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch> {
        let Some(queue) = self.queue(txn) else {
            return Vec::new();
        };
        let batch_ids: BTreeSet<BatchId> = keys
            .iter()
            .filter_map(|key| queue.document_mutations.get(key))
            .flatten()
            .copied()
            .collect();
        self.batches_for_ids(queue, batch_ids)
    }

    /// Batches writing documents directly inside the query's collection, or the queried
    /// document itself.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Vec<MutationBatch> {
        hard_assert(
            !query.is_collection_group_query(),
            "Collection group queries must be resolved per collection before reading batches",
        );
        let Some(queue) = self.queue(txn) else {
            return Vec::new();
        };
        let path = query.path();
        let batch_ids: BTreeSet<BatchId> = queue
            .document_mutations
            .iter()
            .filter(|(key, _)| {
                if query.is_document_query() {
                    key.path() == path
                } else {
                    path.is_immediate_parent_of(key.path())
                }
            })
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        self.batches_for_ids(queue, batch_ids)
    }

    fn batches_for_ids(
        &self,
        queue: &MutationQueueRecord,
        batch_ids: BTreeSet<BatchId>,
    ) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| queue.batches.get(&batch_id).cloned())
            .collect()
    }

    /// Records the acknowledgement of `batch`. The batch itself stays queued until
    /// [`remove_mutation_batch`](Self::remove_mutation_batch).
    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) {
        let queue = self.queue_mut(txn);
        hard_assert(
            batch.batch_id > queue.metadata.last_acknowledged_batch_id,
            "Mutation batch ids must be acknowledged in order",
        );
        queue.metadata.last_acknowledged_batch_id = batch.batch_id;
        queue.metadata.last_stream_token = stream_token;
    }

    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> Vec<u8> {
        self.queue(txn)
            .map(|queue| queue.metadata.last_stream_token.clone())
            .unwrap_or_default()
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, stream_token: Vec<u8>) {
        self.queue_mut(txn).metadata.last_stream_token = stream_token;
    }

    /// Deletes a queued batch and tells the reference delegate about every key it wrote.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let queue = self.queue_mut(txn);
        hard_assert(
            queue.batches.remove(&batch.batch_id).is_some(),
            format!("Cannot remove nonexistent mutation batch {}", batch.batch_id),
        );
        for mutation in &batch.mutations {
            let key = mutation.key();
            if let Some(ids) = queue.document_mutations.get_mut(key) {
                ids.remove(&batch.batch_id);
                if ids.is_empty() {
                    queue.document_mutations.remove(key);
                }
            }
        }
        for key in batch.keys() {
            self.reference_delegate.remove_mutation_reference(txn, &key)?;
        }
        Ok(())
    }

    /// Asserts that an empty queue left no per-document index rows behind.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) {
        if !self.check_empty(txn) {
            return;
        }
        let dangling: Vec<&DocumentKey> = self
            .queue(txn)
            .map(|queue| queue.document_mutations.keys().collect())
            .unwrap_or_default();
        hard_assert(
            dangling.is_empty(),
            format!("Document leak -- detected dangling mutation references when queue is empty. Dangling keys: {dangling:?}"),
        );
    }
}
