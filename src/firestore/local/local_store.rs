use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_lock::Mutex;

use crate::firestore::core::{Query, Target, TargetData, TargetId, TargetPurpose, User};
use crate::firestore::remote::TargetChange;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::persistence::{PersistenceTransaction, TransactionMode};
use crate::firestore::local::reference_delegate::lock_pins;
use crate::firestore::local::{
    BundleCache, BundleMetadata, BundledDocument, DocumentOverlayCache, IndexAutoCreation,
    IndexManager, LocalDocumentsView, LruGarbageCollector, LruResults, MutationQueue, NamedQuery,
    Persistence, QueryEngine, RemoteDocumentCache, TargetCache,
};
use crate::firestore::logger::LOGGER;
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldIndex, IndexOffset, MutableDocument,
    MutableDocumentMap, Mutation, MutationBatch, MutationBatchResult, Precondition, ResourcePath,
    SnapshotVersion, Timestamp, BATCHID_UNKNOWN,
};
use crate::firestore::remote::RemoteEvent;
use crate::util::{fail, hard_assert};

/// A resume token older than this is persisted even without document changes, so that a
/// restarted client does not resume from a token the backend no longer accepts.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Outcome of a local write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Outcome of switching to another identity.
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    /// Local view of every document touched by a batch of either identity.
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Documents matching a query plus the keys the backend last reported for its target.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Documents that entered or left a view, reported back by the view layer.
#[derive(Clone, Debug, Default)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn new(
        target_id: TargetId,
        from_cache: bool,
        added_keys: DocumentKeySet,
        removed_keys: DocumentKeySet,
    ) -> Self {
        Self {
            target_id,
            from_cache,
            added_keys,
            removed_keys,
        }
    }
}

/// Per-identity component handles, swapped wholesale on a user change.
#[derive(Clone, Debug)]
pub(crate) struct Components {
    pub(crate) user: User,
    pub(crate) index_manager: IndexManager,
    pub(crate) mutation_queue: MutationQueue,
    pub(crate) document_overlay_cache: DocumentOverlayCache,
    pub(crate) local_documents: LocalDocumentsView,
    pub(crate) query_engine: QueryEngine,
}

impl Components {
    fn new(persistence: &dyn Persistence, user: &User, index_auto_creation: IndexAutoCreation) -> Self {
        let index_manager = persistence.index_manager(user);
        let mutation_queue = persistence.mutation_queue(user, index_manager.clone());
        let document_overlay_cache = persistence.document_overlay_cache(user);
        let local_documents = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            mutation_queue.clone(),
            document_overlay_cache.clone(),
            index_manager.clone(),
        );
        Self {
            user: user.clone(),
            query_engine: QueryEngine::with_index_auto_creation(local_documents.clone(), index_auto_creation),
            index_manager,
            mutation_queue,
            document_overlay_cache,
            local_documents,
        }
    }
}

#[derive(Debug)]
struct LocalStoreState {
    components: Components,
    /// Active targets, kept in memory so remote events do not need to read them back.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    /// Largest read time handed out by `get_new_document_changes`, per collection group.
    collection_group_read_time: BTreeMap<String, SnapshotVersion>,
    index_auto_creation: IndexAutoCreation,
}

/// Coordinates the caches of one persistence into the operations the sync layer needs.
///
/// Every public operation holds the operation queue for its whole duration, so operations
/// of one local store never interleave.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    remote_document_cache: RemoteDocumentCache,
    target_cache: TargetCache,
    bundle_cache: BundleCache,
    operation_queue: Mutex<()>,
    state: StdMutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, initial_user: User) -> Self {
        let index_auto_creation = IndexAutoCreation::default();
        let components = Components::new(persistence.as_ref(), &initial_user, index_auto_creation);
        Self {
            remote_document_cache: persistence.remote_document_cache(),
            target_cache: persistence.target_cache(),
            bundle_cache: persistence.bundle_cache(),
            persistence,
            operation_queue: Mutex::new(()),
            state: StdMutex::new(LocalStoreState {
                components,
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: BTreeMap::new(),
                collection_group_read_time: BTreeMap::new(),
                index_auto_creation,
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        self.lock_state().components.user.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn components(&self) -> Components {
        self.lock_state().components.clone()
    }

    /// Runs `operation` in a transaction while holding the operation queue.
    pub(crate) async fn run_exclusive<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        mut operation: F,
    ) -> FirestoreResult<T>
    where
        T: Send,
        F: FnMut(&mut PersistenceTransaction<'_>, &Components) -> FirestoreResult<T> + Send,
    {
        let _queue = self.operation_queue.lock().await;
        let components = self.components();
        self.persistence
            .run_transaction(action, mode, |txn| operation(txn, &components))
            .await
    }

    /// Switches to `user` and reports which documents may look different now.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let _queue = self.operation_queue.lock().await;
        let old = self.components();
        let index_auto_creation = self.lock_state().index_auto_creation;
        let new = Components::new(self.persistence.as_ref(), &user, index_auto_creation);

        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old.mutation_queue.get_all_mutation_batches(txn);
                let new_batches = new.mutation_queue.get_all_mutation_batches(txn);

                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                let affected_documents = new.local_documents.get_documents(txn, &changed_keys)?;
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;

        self.lock_state().components = new;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local view of the documents.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument("A write must contain at least one mutation"));
        }
        let _queue = self.operation_queue.lock().await;
        let components = self.components();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();
        let local_write_time = Timestamp::now();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote_documents = self.remote_document_cache.get_entries(txn, &keys);
                let documents_without_remote_version: DocumentKeySet = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = components
                    .local_documents
                    .get_overlayed_documents(txn, remote_documents)?;

                // Pin the values non-idempotent transforms were computed against.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let document = &overlayed.get(mutation.key())?.overlayed_document;
                        let base = mutation.extract_base_value(document)?;
                        let mask = base.field_mask();
                        Some(
                            Mutation::patch(mutation.key().clone(), base, mask)
                                .with_precondition(Precondition::Exists(true)),
                        )
                    })
                    .collect();

                let batch = components.mutation_queue.add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                );
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                components
                    .document_overlay_cache
                    .save_overlays(txn, batch.batch_id, &overlays);

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, document)| (key, document.overlayed_document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies the backend's acknowledgement of a batch.
    ///
    /// Acknowledging a batch that is no longer queued only returns the current local view.
    pub async fn acknowledge_batch(&self, batch_result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let _queue = self.operation_queue.lock().await;
        let components = self.components();

        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let affected = batch.keys();
                if components
                    .mutation_queue
                    .lookup_mutation_batch(txn, batch.batch_id)
                    .is_none()
                {
                    LOGGER.debug(format!("Batch {} was already acknowledged", batch.batch_id));
                    return components.local_documents.get_documents(txn, &affected);
                }

                components
                    .mutation_queue
                    .acknowledge_batch(txn, batch, batch_result.stream_token.clone());
                self.apply_write_to_remote_documents(txn, &components, &batch_result)?;
                components.mutation_queue.perform_consistency_check(txn);
                components
                    .document_overlay_cache
                    .remove_overlays_for_batch_id(txn, &affected, batch.batch_id);
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(
                        txn,
                        &keys_with_transform_results(&batch_result),
                    )?;
                let documents = components.local_documents.get_documents(txn, &affected)?;
                components.index_manager.update_index_entries(txn, &documents);
                Ok(documents)
            })
            .await
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        components: &Components,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in batch.keys() {
            let mut document = self.remote_document_cache.get_entry(txn, &key);
            let Some(ack_version) = batch_result.doc_versions.get(&key).copied() else {
                fail(format!("doc_versions should contain every acknowledged key, missing {key}"));
            };
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, batch_result);
                if document.is_valid_document() {
                    self.remote_document_cache
                        .add_entry(txn, &document, batch_result.commit_version)?;
                }
            }
        }
        components.mutation_queue.remove_mutation_batch(txn, batch)
    }

    /// Drops a batch the backend refused and returns the local view of its documents.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let _queue = self.operation_queue.lock().await;
        let components = self.components();

        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let Some(batch) = components.mutation_queue.lookup_mutation_batch(txn, batch_id) else {
                    fail(format!("Attempt to reject nonexistent batch {batch_id}"));
                };
                let affected = batch.keys();
                components.mutation_queue.remove_mutation_batch(txn, &batch)?;
                components.mutation_queue.perform_consistency_check(txn);
                components
                    .document_overlay_cache
                    .remove_overlays_for_batch_id(txn, &affected, batch_id);
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                let documents = components.local_documents.get_documents(txn, &affected)?;
                components.index_manager.update_index_entries(txn, &documents);
                Ok(documents)
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run_exclusive(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn, components| Ok(components.mutation_queue.get_highest_unacknowledged_batch_id(txn)),
        )
        .await
    }

    /// The first queued batch with an id greater than `after_batch_id`.
    pub async fn get_next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        self.run_exclusive("Get next mutation batch", TransactionMode::ReadOnly, |txn, components| {
            Ok(components
                .mutation_queue
                .get_next_mutation_batch_after_batch_id(txn, after_batch_id))
        })
        .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run_exclusive("Get last remote snapshot version", TransactionMode::ReadOnly, |txn, _| {
            Ok(self.target_cache.get_last_remote_snapshot_version(txn))
        })
        .await
    }

    /// Applies a remote event and returns the local view of every changed document.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<DocumentMap> {
        let _queue = self.operation_queue.lock().await;
        let components = self.components();
        let active_targets = self.lock_state().target_data_by_target.clone();
        let remote_version = event.snapshot_version;

        let (documents, target_data_by_target) = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                let mut target_data_by_target = active_targets.clone();
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };
                    self.target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    self.target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut new_target_data = old_target_data
                        .clone()
                        .with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data =
                            new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(&old_target_data, &new_target_data, change) {
                        self.target_cache.update_target_data(txn, &new_target_data);
                    }
                    target_data_by_target.insert(*target_id, new_target_data);
                }

                let reference_delegate = self.persistence.reference_delegate();
                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        reference_delegate.update_limbo_document(txn, key)?;
                    }
                }

                let updates = event
                    .document_updates
                    .iter()
                    .map(|(key, document)| {
                        let mut document = document.clone();
                        document.set_read_time(remote_version);
                        (key.clone(), document)
                    })
                    .collect();
                let (changed_documents, existence_changed) =
                    self.populate_document_changes(txn, &updates)?;

                if !remote_version.is_min() {
                    let last_remote_version = self.target_cache.get_last_remote_snapshot_version(txn);
                    hard_assert(
                        remote_version >= last_remote_version,
                        format!(
                            "Watch stream reverted to previous snapshot?? {remote_version:?} < {last_remote_version:?}"
                        ),
                    );
                    let sequence_number = txn.current_sequence_number();
                    self.target_cache
                        .set_targets_metadata(txn, sequence_number, Some(remote_version));
                }

                let documents = components.local_documents.get_local_view_of_documents(
                    txn,
                    changed_documents,
                    &existence_changed,
                )?;
                Ok((documents, target_data_by_target))
            })
            .await?;

        self.lock_state().target_data_by_target = target_data_by_target;
        Ok(documents)
    }

    /// Writes the newer document versions into the remote document cache, each at its own
    /// read time.
    ///
    /// Returns the documents that were stored and the keys whose existence changed.
    fn populate_document_changes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        updates: &BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<(MutableDocumentMap, DocumentKeySet)> {
        let keys: DocumentKeySet = updates.keys().cloned().collect();
        let existing_documents = self.remote_document_cache.get_entries(txn, &keys);

        let mut changed = MutableDocumentMap::new();
        let mut existence_changed = DocumentKeySet::new();
        for (key, document) in updates {
            let existing = existing_documents
                .get(key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));

            if document.is_found_document() != existing.is_found_document() {
                existence_changed.insert(key.clone());
            }

            if document.is_no_document() && document.version().is_min() {
                // A deleted document at version zero means "forget this document".
                self.remote_document_cache.remove_entry(txn, key);
                changed.insert(key.clone(), document.clone());
            } else if !existing.is_valid_document()
                || document.version() > existing.version()
                || (document.version() == existing.version() && existing.has_pending_writes())
            {
                let read_time = document.read_time();
                hard_assert(
                    !read_time.is_min(),
                    "Cannot add a document when the remote version is zero",
                );
                self.remote_document_cache.add_entry(txn, document, read_time)?;
                changed.insert(key.clone(), document.clone());
            } else {
                LOGGER.debug(format!(
                    "Ignoring outdated watch update for {key}. Current version: {:?} Watch version: {:?}",
                    existing.version(),
                    document.version()
                ));
            }
        }
        Ok((changed, existence_changed))
    }

    /// Records which documents the views of each target currently show.
    ///
    /// Failures to update sequence numbers are transient and only logged.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        let _queue = self.operation_queue.lock().await;
        let reference_delegate = self.persistence.reference_delegate();

        let result = self
            .persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in &view_changes {
                    {
                        let mut pins = lock_pins(reference_delegate.in_memory_pins());
                        pins.add_references(&change.added_keys, change.target_id);
                        pins.remove_references(&change.removed_keys, change.target_id);
                    }
                    for key in &change.added_keys {
                        reference_delegate.add_reference(txn, change.target_id, key)?;
                    }
                    for key in &change.removed_keys {
                        reference_delegate.remove_reference(txn, change.target_id, key)?;
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                LOGGER.debug(format!("Failed to update sequence numbers: {err}"));
            }
            Err(err) => return Err(err),
        }

        let mut state = self.lock_state();
        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = state.target_data_by_target.get_mut(&change.target_id) {
                // Advance the limbo-free version so later queries can reuse these results.
                target_data.last_limbo_free_snapshot_version = target_data.snapshot_version;
            }
        }
        Ok(())
    }

    /// Assigns a target id to `target`, reusing cached target data when present.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let _queue = self.operation_queue.lock().await;
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = self.target_cache.get_target_data(txn, &target) {
                    return Ok(cached);
                }
                let target_id = self.target_cache.allocate_target_id(txn);
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                self.target_cache.add_target_data(txn, &target_data);
                Ok(target_data)
            })
            .await?;

        let mut state = self.lock_state();
        let newer = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if newer {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Target data of an active target, or of a cached one when the target is not active.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.active_target_data(target) {
            return Ok(Some(target_data));
        }
        self.run_exclusive("Get target data", TransactionMode::ReadOnly, |txn, _| {
            Ok(self.target_cache.get_target_data(txn, target))
        })
        .await
    }

    fn active_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.lock_state();
        let target_id = state.target_id_by_canonical_id.get(&target.canonical_id())?;
        state
            .target_data_by_target
            .get(target_id)
            .filter(|data| &data.target == target)
            .cloned()
    }

    /// Stops tracking a target.
    ///
    /// Unless `keep_persisted_target_data` is set, the target's data is handed to the
    /// reference delegate and its local-view pins are dropped.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let _queue = self.operation_queue.lock().await;
        let target_data = self.lock_state().target_data_by_target.get(&target_id).cloned();
        let Some(target_data) = target_data else {
            fail(format!("Tried to release nonexistent target: {target_id}"));
        };

        let reference_delegate = self.persistence.reference_delegate();
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        let removed_references = if keep_persisted_target_data {
            DocumentKeySet::new()
        } else {
            lock_pins(reference_delegate.in_memory_pins()).remove_references_for_id(target_id)
        };

        let result = self
            .persistence
            .run_transaction("Release target", mode, |txn| {
                if keep_persisted_target_data {
                    let persisted = self.target_cache.get_target_data_for_id(txn, target_id);
                    if persisted.as_ref() != Some(&target_data) {
                        self.target_cache.update_target_data(txn, &target_data);
                    }
                    return Ok(());
                }
                for key in &removed_references {
                    reference_delegate.remove_reference(txn, target_id, key)?;
                }
                reference_delegate.remove_target(txn, &target_data)
            })
            .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                LOGGER.debug(format!(
                    "Failed to update sequence numbers for target {target_id}: {err}"
                ));
            }
            Err(err) => return Err(err),
        }

        let mut state = self.lock_state();
        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local caches.
    ///
    /// With `use_previous_results` the documents the backend last reported for the query's
    /// target seed the result, which avoids a full collection scan.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let active = self.active_target_data(&target);

        self.run_exclusive("Execute query", TransactionMode::ReadWrite, |txn, components| {
            let target_data = active
                .clone()
                .or_else(|| self.target_cache.get_target_data(txn, &target));
            let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
                Some(data) => (
                    data.last_limbo_free_snapshot_version,
                    self.target_cache.get_matching_keys_for_target_id(txn, data.target_id),
                ),
                None => (SnapshotVersion::min(), DocumentKeySet::new()),
            };

            let documents = if use_previous_results {
                components.query_engine.get_documents_matching_query(
                    txn,
                    query,
                    last_limbo_free_snapshot_version,
                    &remote_keys,
                )?
            } else {
                components.query_engine.get_documents_matching_query(
                    txn,
                    query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
        .await
    }

    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.run_exclusive("Get remote document keys", TransactionMode::ReadOnly, |txn, _| {
            Ok(self.target_cache.get_matching_keys_for_target_id(txn, target_id))
        })
        .await
    }

    /// Local view of one document; an invalid document when nothing is known about it.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run_exclusive("Read document", TransactionMode::ReadOnly, |txn, components| {
            Ok(components.local_documents.get_document(txn, key))
        })
        .await
    }

    /// Makes the configured field indexes match `indexes`, keeping unchanged ones intact.
    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run_exclusive("Configure indexes", TransactionMode::ReadWrite, |txn, components| {
            let index_manager = &components.index_manager;
            let existing = index_manager.get_field_indexes(txn, None);
            for index in &existing {
                if !indexes.iter().any(|wanted| wanted.semantic_cmp(index).is_eq()) {
                    index_manager.delete_field_index(txn, index);
                }
            }
            for index in &indexes {
                if !existing.iter().any(|current| current.semantic_cmp(index).is_eq()) {
                    index_manager.add_field_index(txn, index);
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.run_exclusive("Delete all indexes", TransactionMode::ReadWrite, |txn, components| {
            components.index_manager.delete_all_field_indexes(txn);
            Ok(())
        })
        .await
    }

    /// Turns automatic index creation after expensive full scans on or off.
    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.update_index_auto_creation(|settings| settings.enabled = enabled);
    }

    pub fn set_index_auto_creation_min_collection_size(&self, min_collection_size: usize) {
        self.update_index_auto_creation(|settings| settings.min_collection_size = min_collection_size);
    }

    pub fn set_relative_index_read_cost_per_document(&self, cost: f64) {
        self.update_index_auto_creation(|settings| {
            settings.relative_index_read_cost_per_document = cost;
        });
    }

    fn update_index_auto_creation(&self, update: impl FnOnce(&mut IndexAutoCreation)) {
        let mut state = self.lock_state();
        update(&mut state.index_auto_creation);
        let settings = state.index_auto_creation;
        let local_documents = state.components.local_documents.clone();
        state.components.query_engine = QueryEngine::with_index_auto_creation(local_documents, settings);
    }

    /// Remote documents of `collection_group` read since the previous call, or since
    /// startup on the first call.
    pub async fn get_new_document_changes(&self, collection_group: &str) -> FirestoreResult<MutableDocumentMap> {
        let read_time = self
            .lock_state()
            .collection_group_read_time
            .get(collection_group)
            .copied()
            .unwrap_or_else(SnapshotVersion::min);
        let changes = self
            .run_exclusive("Get new document changes", TransactionMode::ReadOnly, |txn, _| {
                Ok(self.remote_document_cache.get_all_from_collection_group(
                    txn,
                    collection_group,
                    &IndexOffset::create_successor(read_time, BATCHID_UNKNOWN),
                    usize::MAX,
                ))
            })
            .await?;

        let mut state = self.lock_state();
        let latest = state
            .collection_group_read_time
            .entry(collection_group.to_string())
            .or_insert_with(SnapshotVersion::min);
        for document in changes.values() {
            if document.read_time() > *latest {
                *latest = document.read_time();
            }
        }
        Ok(changes)
    }

    /// Local view of the documents a queued batch writes, or `None` when the batch is gone.
    pub async fn lookup_mutation_documents(&self, batch_id: BatchId) -> FirestoreResult<Option<DocumentMap>> {
        self.run_exclusive("Lookup mutation documents", TransactionMode::ReadOnly, |txn, components| {
            match components.mutation_queue.lookup_mutation_keys(txn, batch_id) {
                Some(keys) => Ok(Some(components.local_documents.get_documents(txn, &keys)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Forgets the keys remembered for a batch another process has finished.
    pub fn remove_cached_mutation_batch_metadata(&self, batch_id: BatchId) {
        self.components()
            .mutation_queue
            .remove_cached_mutation_keys(batch_id);
    }

    /// The target behind `target_id`, from the active targets or the target cache.
    pub async fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        let active = self
            .lock_state()
            .target_data_by_target
            .get(&target_id)
            .map(|data| data.target.clone());
        if active.is_some() {
            return Ok(active);
        }
        self.run_exclusive("Get target data", TransactionMode::ReadOnly, |txn, _| {
            Ok(self
                .target_cache
                .get_target_data_for_id(txn, target_id)
                .map(|data| data.target))
        })
        .await
    }

    /// Ids of every process currently sharing the persistence.
    pub async fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        self.persistence.get_active_clients().await
    }

    /// Whether a bundle with the same id and an equal or newer create time was loaded.
    pub async fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        let cached = self
            .run_exclusive("Has newer bundle", TransactionMode::ReadOnly, |txn, _| {
                Ok(self.bundle_cache.get_bundle_metadata(txn, &metadata.id))
            })
            .await?;
        Ok(cached.is_some_and(|cached| cached.create_time >= metadata.create_time))
    }

    pub async fn save_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.run_exclusive("Save bundle", TransactionMode::ReadWrite, |txn, _| {
            self.bundle_cache.save_bundle_metadata(txn, metadata);
            Ok(())
        })
        .await
    }

    /// Stores bundled documents as remote documents and returns their local view.
    ///
    /// The keys of every found document are held by a target named after the bundle, so
    /// they are not collected before a query picks them up.
    pub async fn apply_bundled_documents(
        &self,
        documents: Vec<BundledDocument>,
        bundle_name: &str,
    ) -> FirestoreResult<DocumentMap> {
        let umbrella = Query::new(ResourcePath::from_string(&format!("__bundle__/docs/{bundle_name}"))?);
        let umbrella_target = self.allocate_target(umbrella.to_target()).await?;

        let mut found_keys = DocumentKeySet::new();
        let mut updates = BTreeMap::new();
        for bundled in &documents {
            if bundled.document.is_some() {
                found_keys.insert(bundled.key.clone());
            }
            updates.insert(bundled.key.clone(), bundled.to_mutable_document());
        }

        self.run_exclusive("Apply bundle documents", TransactionMode::ReadWrite, |txn, components| {
            let (changed_documents, existence_changed) = self.populate_document_changes(txn, &updates)?;
            self.target_cache
                .remove_matching_keys_for_target_id(txn, umbrella_target.target_id)?;
            self.target_cache
                .add_matching_keys(txn, &found_keys, umbrella_target.target_id)?;
            components
                .local_documents
                .get_local_view_of_documents(txn, changed_documents, &existence_changed)
        })
        .await
    }

    pub async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.run_exclusive("Get named query", TransactionMode::ReadOnly, |txn, _| {
            Ok(self.bundle_cache.get_named_query(txn, name))
        })
        .await
    }

    /// Saves a bundled query and, when the bundle is newer than what the target already
    /// knows, makes `documents` the target's results as of the query's read time.
    pub async fn save_named_query(&self, named_query: &NamedQuery, documents: &DocumentKeySet) -> FirestoreResult<()> {
        let allocated = self.allocate_target(named_query.query.to_target()).await?;
        let read_time = named_query.read_time;

        let updated = self
            .run_exclusive("Save named query", TransactionMode::ReadWrite, |txn, _| {
                if allocated.snapshot_version >= read_time {
                    self.bundle_cache.save_named_query(txn, named_query);
                    return Ok(None);
                }
                let target_data = allocated.clone().with_resume_token(Vec::new(), read_time);
                self.target_cache.update_target_data(txn, &target_data);
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, target_data.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, documents, target_data.target_id)?;
                self.bundle_cache.save_named_query(txn, named_query);
                Ok(Some(target_data))
            })
            .await?;

        if let Some(target_data) = updated {
            self.lock_state()
                .target_data_by_target
                .insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    /// Runs one LRU pass. Active targets are never collected.
    pub async fn collect_garbage(&self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let _queue = self.operation_queue.lock().await;
        let active_target_ids = self
            .lock_state()
            .target_data_by_target
            .keys()
            .copied()
            .collect();
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                garbage_collector.collect(txn, &active_target_ids)
            })
            .await
    }
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let time_delta = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.has_document_changes()
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> DocumentKeySet {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(&batch_result.mutation_results)
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

impl Debug for LocalStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LocalStore")
            .field("user", &state.components.user)
            .field("active_targets", &state.target_data_by_target.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::TargetChange;
    use crate::firestore::local::{LruParams, MemoryPersistence};
    use crate::firestore::model::{FieldPath, MutationResult, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(field: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        data
    }

    async fn store() -> LocalStore {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::with_eager_gc());
        persistence.start().await.unwrap();
        LocalStore::new(persistence, User::unauthenticated())
    }

    fn ack(batch: MutationBatch, version: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(SnapshotVersion::from_micros(version)))
            .collect();
        MutationBatchResult::from(batch, SnapshotVersion::from_micros(version), results, vec![1])
    }

    async fn batch(store: &LocalStore, batch_id: BatchId) -> MutationBatch {
        store
            .run_exclusive("lookup", TransactionMode::ReadOnly, |txn, components| {
                Ok(components.mutation_queue.lookup_mutation_batch(txn, batch_id))
            })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn write_then_reject_restores_remote_view() {
        let store = store().await;
        let write = store
            .write_locally(vec![Mutation::set(key("c/a"), map("n", 1))])
            .await
            .unwrap();
        assert!(write.changes[&key("c/a")].has_local_mutations());

        let documents = store.reject_batch(write.batch_id).await.unwrap();
        assert!(!documents[&key("c/a")].is_found_document());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), -1);
    }

    #[tokio::test(flavor = "current_thread")]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    async fn rejecting_unknown_batch_fails() {
        let store = store().await;
        let _ = store.reject_batch(42).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn acknowledgement_is_idempotent() {
        let store = store().await;
        let write = store
            .write_locally(vec![Mutation::set(key("c/a"), map("n", 1))])
            .await
            .unwrap();
        let batch = batch(&store, write.batch_id).await;

        let first = store.acknowledge_batch(ack(batch.clone(), 10)).await.unwrap();
        let second = store.acknowledge_batch(ack(batch, 10)).await.unwrap();
        assert_eq!(first[&key("c/a")].data(), second[&key("c/a")].data());
        assert_eq!(first[&key("c/a")].version(), SnapshotVersion::from_micros(10));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_remote_updates_are_ignored() {
        let store = store().await;
        let target = Query::new(ResourcePath::from_string("c").unwrap()).to_target();
        let target_data = store.allocate_target(target).await.unwrap();
        let newer = MutableDocument::new_found_document(key("c/a"), SnapshotVersion::from_micros(20), map("n", 2));
        store
            .apply_remote_event(
                RemoteEvent::new(SnapshotVersion::from_micros(20))
                    .with_target_change(target_data.target_id, TargetChange::new(vec![7], true).with_added(key("c/a")))
                    .with_document_update(newer),
            )
            .await
            .unwrap();

        let older = MutableDocument::new_found_document(key("c/a"), SnapshotVersion::from_micros(15), map("n", 1));
        let changed = store
            .apply_remote_event(RemoteEvent::new(SnapshotVersion::from_micros(30)).with_document_update(older))
            .await
            .unwrap();
        assert!(changed.is_empty());
        let document = store.read_document(&key("c/a")).await.unwrap();
        assert_eq!(document.version(), SnapshotVersion::from_micros(20));
        assert_eq!(
            store.get_last_remote_snapshot_version().await.unwrap(),
            SnapshotVersion::from_micros(30)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    async fn snapshot_version_never_regresses() {
        let store = store().await;
        store
            .apply_remote_event(RemoteEvent::new(SnapshotVersion::from_micros(30)))
            .await
            .unwrap();
        let _ = store
            .apply_remote_event(RemoteEvent::new(SnapshotVersion::from_micros(20)))
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn user_change_reports_both_queues() {
        let store = store().await;
        store
            .write_locally(vec![Mutation::set(key("c/anon"), map("n", 1))])
            .await
            .unwrap();
        let result = store.handle_user_change(User::authenticated("alice")).await.unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(result.affected_documents.contains_key(&key("c/anon")));
        assert!(!store.read_document(&key("c/anon")).await.unwrap().is_valid_document());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn allocate_reuses_cached_target_data() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::with_lru_gc(LruParams::default()));
        persistence.start().await.unwrap();
        let store = LocalStore::new(persistence, User::unauthenticated());
        let target = Query::new(ResourcePath::from_string("c").unwrap()).to_target();
        let first = store.allocate_target(target.clone()).await.unwrap();
        store.release_target(first.target_id, true).await.unwrap();
        let second = store.allocate_target(target.clone()).await.unwrap();
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(store.get_target_data(&target).await.unwrap().unwrap().target_id, first.target_id);
    }
}
