use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::OverlayMap;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::{DocumentOverlayCache, IndexManager, MutationQueue, RemoteDocumentCache};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask,
    IndexOffset, MutableDocument, MutableDocumentMap, MutationKind, Overlay, OverlayedDocument,
    Timestamp, BATCHID_UNKNOWN,
};

/// Documents returned by an incremental read together with the largest batch id whose
/// overlays were included.
#[derive(Clone, Debug, Default)]
pub struct LocalDocumentsResult {
    pub batch_id: BatchId,
    pub documents: DocumentMap,
}

/// Read-side composition of the caches: remote documents with their overlays applied.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_document_cache: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    document_overlay_cache: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        document_overlay_cache: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            document_overlay_cache,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn document_overlay_cache(&self) -> &DocumentOverlayCache {
        &self.document_overlay_cache
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    /// Local view of a single document. Returns an invalid document when nothing is known.
    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        let overlay = self.document_overlay_cache.get_overlay(txn, key);
        let mut document = self.get_base_document(txn, key, overlay.as_ref());
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::new()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let documents = self.remote_document_cache.get_entries(txn, keys);
        self.get_local_view_of_documents(txn, documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed` whose overlay is a
    /// patch (or missing) get their overlay recalculated first.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let mut overlays = OverlayMap::new();
        self.populate_overlays(txn, &mut overlays, documents.keys());
        let views = self.compute_views(txn, documents, &overlays, existence_state_changed)?;
        Ok(views
            .into_iter()
            .map(|(key, view)| (key, view.overlayed_document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents) but keeps the
    /// mask of fields each overlay changed.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut overlays = OverlayMap::new();
        self.populate_overlays(txn, &mut overlays, documents.keys());
        self.compute_views(txn, documents, &overlays, &DocumentKeySet::new())
    }

    fn populate_overlays<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        overlays: &mut OverlayMap,
        keys: impl Iterator<Item = &'k DocumentKey>,
    ) {
        let missing: DocumentKeySet = keys
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.document_overlay_cache.get_overlays(txn, &missing));
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: MutableDocumentMap,
        overlays: &OverlayMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay.map_or(true, |overlay| {
                matches!(overlay.mutation.kind(), MutationKind::Patch { .. })
            });
            if existence_state_changed.contains(key) && is_patch {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask().cloned();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay
                    .mutation
                    .apply_to_local_view(document, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::new()));
            }
        }

        let recalculated_masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        mutated_fields.extend(recalculated_masks);
        documents.extend(recalculate);

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).flatten();
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Replays every queued batch touching `documents` onto them (in place) and saves one
    /// overlay per document under the largest batch id that touched it.
    ///
    /// Returns the accumulated field mask per document; `None` means fully replaced.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::new()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(key), masks.get(key)) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key.clone(), mutation);
                }
            }
            self.document_overlay_cache
                .save_overlays(txn, *batch_id, &overlays);
        }
        Ok(masks)
    }

    /// Recalculates overlays for `keys` starting from their remote documents.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_document_cache.get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Found documents matching `query` in the local view, considering only remote
    /// documents read after `offset` and overlays written after its batch id.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> DocumentMap {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, offset, context)
        } else {
            self.get_documents_matching_collection_query(txn, query, offset, context)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> DocumentMap {
        let mut result = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = self.get_document(txn, &key);
            if document.is_found_document() {
                result.insert(key, document);
            }
        }
        result
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> DocumentMap {
        let collection_id = query.collection_group();
        let mut result = DocumentMap::new();
        for parent in self.index_manager.get_collection_parents(txn, &collection_id) {
            let collection = parent.child([collection_id.as_str()]);
            if !query.path().is_prefix_of(&collection) {
                continue;
            }
            let collection_query = query.as_collection_query_at_path(collection);
            result.extend(self.get_documents_matching_collection_query(
                txn,
                &collection_query,
                offset,
                context.as_deref_mut(),
            ));
        }
        result
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> DocumentMap {
        let overlays = self.document_overlay_cache.get_overlays_for_collection(
            txn,
            query.path(),
            offset.largest_batch_id,
        );
        let overlay_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut documents = self
            .remote_document_cache
            .get_documents_matching_query(txn, query, offset, &overlay_keys, context);

        // A document may only match because of its overlay.
        for key in &overlay_keys {
            documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay.mutation.apply_to_local_view(
                        &mut document,
                        Some(FieldMask::new()),
                        Timestamp::now(),
                    );
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }

    /// Up to `count` documents of the collection group after `offset`, remote documents
    /// first and then documents that only changed through overlays.
    pub fn get_next_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<LocalDocumentsResult> {
        let original = self
            .remote_document_cache
            .get_all_from_collection_group(txn, collection_group, offset, count);
        let mut overlays = if count > original.len() {
            self.document_overlay_cache.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                count - original.len(),
            )
        } else {
            OverlayMap::new()
        };

        let mut largest_batch_id = BATCHID_UNKNOWN;
        let mut documents = original.clone();
        for (key, overlay) in &overlays {
            largest_batch_id = largest_batch_id.max(overlay.largest_batch_id);
            if !original.contains_key(key) {
                documents.insert(key.clone(), self.get_base_document(txn, key, Some(overlay)));
            }
        }

        self.populate_overlays(txn, &mut overlays, original.keys());
        let views = self.compute_views(txn, documents, &overlays, &DocumentKeySet::new())?;
        Ok(LocalDocumentsResult {
            batch_id: largest_batch_id,
            documents: views
                .into_iter()
                .map(|(key, view)| (key, view.overlayed_document))
                .collect(),
        })
    }

    /// The remote document when the overlay is a patch (or absent); otherwise the remote
    /// state does not matter and an invalid document is used.
    fn get_base_document(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> MutableDocument {
        match overlay.map(|overlay| overlay.mutation.kind()) {
            None | Some(MutationKind::Patch { .. }) => self.remote_document_cache.get_entry(txn, key),
            Some(_) => MutableDocument::new_invalid_document(key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::schema::LocalDatabase;
    use crate::firestore::local::EagerReferenceDelegate;
    use crate::firestore::model::{
        FieldPath, FieldTransform, Mutation, ResourcePath, SnapshotVersion, TransformOperation,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        data
    }

    fn view() -> LocalDocumentsView {
        let user = User::unauthenticated();
        let index_manager = IndexManager::new(&user);
        LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MutationQueue::new(&user, index_manager.clone(), Arc::new(EagerReferenceDelegate::new())),
            DocumentOverlayCache::new(&user),
            index_manager,
        )
    }

    fn remote(txn: &mut PersistenceTransaction<'_>, path: &str, data: MapValue, read_time: i64) {
        let document =
            MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(read_time), data);
        RemoteDocumentCache::new()
            .add_entry(txn, &document, SnapshotVersion::from_micros(read_time))
            .unwrap();
    }

    fn write(view: &LocalDocumentsView, txn: &mut PersistenceTransaction<'_>, mutation: Mutation) {
        let batch = view
            .mutation_queue()
            .add_mutation_batch(txn, Timestamp::now(), Vec::new(), vec![mutation]);
        view.recalculate_and_save_overlays_for_document_keys(txn, &batch.keys())
            .unwrap();
    }

    #[test]
    fn overlays_are_applied_on_top_of_remote_documents() {
        let view = view();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        remote(&mut txn, "c/a", map(&[("x", FirestoreValue::from_integer(1))]), 5);
        write(
            &view,
            &mut txn,
            Mutation::patch(
                key("c/a"),
                map(&[("y", FirestoreValue::from_integer(2))]),
                [field("y")].into_iter().collect(),
            ),
        );

        let document = view.get_document(&txn, &key("c/a"));
        assert_eq!(document.field(&field("x")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(document.field(&field("y")), Some(&FirestoreValue::from_integer(2)));
        assert!(document.has_local_mutations());
    }

    #[test]
    fn recalculation_tags_overlay_with_largest_batch() {
        let view = view();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        write(&view, &mut txn, Mutation::set(key("c/a"), map(&[("n", FirestoreValue::from_integer(1))])));
        write(
            &view,
            &mut txn,
            Mutation::patch(key("c/a"), MapValue::empty(), FieldMask::new()).with_field_transforms(vec![
                FieldTransform::new(field("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(4))),
            ]),
        );

        let overlay = view.document_overlay_cache().get_overlay(&txn, &key("c/a")).unwrap();
        assert_eq!(overlay.largest_batch_id, 2);
        assert!(matches!(overlay.mutation.kind(), MutationKind::Set { .. }));
        let document = view.get_document(&txn, &key("c/a"));
        assert_eq!(document.field(&field("n")), Some(&FirestoreValue::from_integer(5)));
    }

    #[test]
    fn collection_queries_include_overlay_only_documents() {
        let view = view();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        remote(&mut txn, "c/a", map(&[("n", FirestoreValue::from_integer(1))]), 5);
        write(&view, &mut txn, Mutation::set(key("c/b"), map(&[("n", FirestoreValue::from_integer(2))])));
        write(&view, &mut txn, Mutation::delete(key("c/a")));

        let query = Query::new(ResourcePath::from_string("c").unwrap());
        let results = view.get_documents_matching_query(&txn, &query, &IndexOffset::none(), None);
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/b")]);

        let group = Query::collection_group_query("c");
        let results = view.get_documents_matching_query(&txn, &group, &IndexOffset::none(), None);
        assert_eq!(results.len(), 1);

        let single = Query::new(ResourcePath::from_string("c/b").unwrap());
        assert_eq!(view.get_documents_matching_query(&txn, &single, &IndexOffset::none(), None).len(), 1);
    }

    #[test]
    fn next_documents_fill_the_budget_with_overlays() {
        let view = view();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        remote(&mut txn, "c/a", map(&[("n", FirestoreValue::from_integer(1))]), 5);
        write(&view, &mut txn, Mutation::set(key("c/b"), map(&[("n", FirestoreValue::from_integer(2))])));

        let result = view.get_next_documents(&mut txn, "c", &IndexOffset::none(), 5).unwrap();
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.batch_id, 1);

        let capped = view.get_next_documents(&mut txn, "c", &IndexOffset::none(), 1).unwrap();
        assert_eq!(capped.documents.len(), 1);
        assert_eq!(capped.batch_id, BATCHID_UNKNOWN);
    }

    fn assert_view_matches_replay(view: &LocalDocumentsView, txn: &PersistenceTransaction<'_>, paths: &[&str]) {
        let batches = view.mutation_queue().get_all_mutation_batches(txn);
        for path in paths {
            let mut expected = RemoteDocumentCache::new().get_entry(txn, &key(path));
            for batch in &batches {
                batch.apply_to_local_view(&mut expected, Some(FieldMask::new()));
            }
            let actual = view.get_document(txn, &key(path));
            assert_eq!(actual.is_found_document(), expected.is_found_document(), "{path}");
            if expected.is_found_document() {
                assert_eq!(actual.data(), expected.data(), "{path}");
            }
        }
    }

    fn drop_batch(view: &LocalDocumentsView, txn: &mut PersistenceTransaction<'_>, batch_id: BatchId) {
        let batch = view
            .mutation_queue()
            .lookup_mutation_batch(txn, batch_id)
            .unwrap();
        let keys = batch.keys();
        view.mutation_queue().remove_mutation_batch(txn, &batch).unwrap();
        view.document_overlay_cache()
            .remove_overlays_for_batch_id(txn, &keys, batch_id);
        view.recalculate_and_save_overlays_for_document_keys(txn, &keys)
            .unwrap();
    }

    #[test]
    fn overlays_equal_replaying_remaining_batches() {
        let view = view();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        let paths = ["c/a", "c/b", "c/c"];
        let int = FirestoreValue::from_integer;
        remote(&mut txn, "c/a", map(&[("x", int(1))]), 5);
        remote(&mut txn, "c/b", map(&[("x", int(2))]), 5);

        write(&view, &mut txn, Mutation::patch(key("c/a"), map(&[("y", int(2))]), [field("y")].into_iter().collect()));
        write(&view, &mut txn, Mutation::delete(key("c/b")));
        write(&view, &mut txn, Mutation::set(key("c/b"), map(&[("z", int(3))])));
        write(&view, &mut txn, Mutation::patch(key("c/a"), map(&[("x", int(9))]), [field("x")].into_iter().collect()));
        write(&view, &mut txn, Mutation::patch(key("c/c"), map(&[("w", int(1))]), [field("w")].into_iter().collect()));
        assert_view_matches_replay(&view, &txn, &paths);

        drop_batch(&view, &mut txn, 3);
        assert_view_matches_replay(&view, &txn, &paths);
        assert!(!view.get_document(&txn, &key("c/b")).is_found_document());

        drop_batch(&view, &mut txn, 1);
        assert_view_matches_replay(&view, &txn, &paths);
        let a = view.get_document(&txn, &key("c/a"));
        assert_eq!(a.field(&field("x")), Some(&int(9)));
        assert_eq!(a.field(&field("y")), None);

        drop_batch(&view, &mut txn, 2);
        assert_view_matches_replay(&view, &txn, &paths);
        assert_eq!(view.get_document(&txn, &key("c/b")).field(&field("x")), Some(&int(2)));
    }
}
