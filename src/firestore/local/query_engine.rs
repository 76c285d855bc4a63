use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexType;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::LocalDocumentsView;
use crate::firestore::model::{
    DocumentKeySet, DocumentMap, IndexOffset, MutableDocument, SnapshotVersion, BATCHID_UNKNOWN,
};

/// Counters collected while a query runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    /// Documents read from the remote document cache, matching or not.
    pub document_read_count: usize,
}

/// When a full collection scan is expensive enough to justify creating a field index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexAutoCreation {
    pub enabled: bool,
    /// Scans reading fewer documents never create an index.
    pub min_collection_size: usize,
    /// Cost of reading one document through an index, relative to reading it during a scan.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreation {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }
}

/// Picks the cheapest way to answer a query from the local caches.
///
/// In order of preference: a configured field index, the documents the backend last
/// reported for the target (when they are known to be free of limbo documents), and finally a
/// full scan of the collection.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
    index_auto_creation: IndexAutoCreation,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView) -> Self {
        Self::with_index_auto_creation(local_documents, IndexAutoCreation::default())
    }

    pub fn with_index_auto_creation(
        local_documents: LocalDocumentsView,
        index_auto_creation: IndexAutoCreation,
    ) -> Self {
        Self {
            local_documents,
            index_auto_creation,
        }
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        if let Some(documents) = self.perform_query_using_index(txn, query)? {
            return Ok(documents);
        }
        if let Some(documents) = self.perform_query_using_remote_keys(
            txn,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        )? {
            return Ok(documents);
        }
        let mut context = QueryContext::default();
        let documents = self.execute_full_collection_scan(txn, query, &mut context);
        if self.index_auto_creation.enabled {
            self.create_cache_indexes(txn, query, &context, documents.len());
        }
        Ok(documents)
    }

    /// Creates an index for `query` when the scan that just answered it read many more
    /// documents than an index lookup would have.
    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        let settings = &self.index_auto_creation;
        if context.document_read_count < settings.min_collection_size {
            log::debug!(
                "Not creating cache indexes for {}: collections with fewer than {} documents are scanned",
                query.canonical_id(),
                settings.min_collection_size
            );
            return;
        }
        log::debug!(
            "Query {} scanned {} local documents and returned {result_size}",
            query.canonical_id(),
            context.document_read_count
        );
        if context.document_read_count as f64
            > settings.relative_index_read_cost_per_document * result_size as f64
        {
            self.local_documents
                .index_manager()
                .create_target_indexes(txn, &query.to_target());
        }
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }

        let index_manager = self.local_documents.index_manager();
        let mut query = query.clone();
        let mut target = query.to_target();
        match index_manager.get_index_type(txn, &target) {
            IndexType::None => return Ok(None),
            IndexType::Partial if query.has_limit() => {
                // A partial index cannot tell which documents sit at the limit edge.
                query = query.with_limit(None, LimitType::First);
                target = query.to_target();
            }
            _ => {}
        }

        let Some(keys) = index_manager.get_documents_matching_target(txn, &target) else {
            return Ok(None);
        };
        let documents = self.local_documents.get_documents(txn, &keys)?;
        let offset = index_manager.get_min_offset(txn, &target);
        let previous_results = apply_query(&query, &documents);

        if needs_refill(&query, &previous_results, &keys, offset.read_time) {
            log::debug!("Index results for {} need a refill", query.canonical_id());
            let unlimited = query.with_limit(None, LimitType::First);
            return self.perform_query_using_index(txn, &unlimited);
        }
        Ok(Some(self.append_remaining_results(txn, previous_results, &query, &offset)))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = self.local_documents.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, &documents);
        if query.has_limit()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return Ok(None);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version:?} to execute query: {}",
            query.canonical_id()
        );
        let offset = IndexOffset::create_successor(last_limbo_free_snapshot_version, BATCHID_UNKNOWN);
        Ok(Some(self.append_remaining_results(txn, previous_results, query, &offset)))
    }

    fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        context: &mut QueryContext,
    ) -> DocumentMap {
        log::debug!("Using full collection scan to execute query: {}", query.canonical_id());
        self.local_documents
            .get_documents_matching_query(txn, query, &IndexOffset::none(), Some(context))
    }

    /// Adds every document that changed after `offset` to the previously known results.
    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction<'_>,
        previous_results: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> DocumentMap {
        let mut remaining = self
            .local_documents
            .get_documents_matching_query(txn, query, offset, None);
        for document in previous_results {
            remaining.insert(document.key().clone(), document);
        }
        remaining
    }
}

/// Matching documents in query order, without applying the limit.
fn apply_query(query: &Query, documents: &DocumentMap) -> Vec<MutableDocument> {
    let mut results: Vec<MutableDocument> = documents
        .values()
        .filter(|document| query.matches(document))
        .cloned()
        .collect();
    results.sort_by(|left, right| query.compare_documents(left, right));
    results
}

/// Whether a limited query must be re-run without relying on the previous results.
///
/// That is the case when a previous result no longer matches, or when the document at the
/// limit edge changed after the results were computed: another document may now belong in
/// the result instead.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    edge.is_some_and(|document| {
        document.has_pending_writes()
            || document.version() > limbo_free_snapshot_version
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::{FieldFilter, FilterOperator, User};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::schema::LocalDatabase;
    use crate::firestore::local::{
        DocumentOverlayCache, EagerReferenceDelegate, IndexManager, MutationQueue, RemoteDocumentCache,
    };
    use crate::firestore::model::{
        DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, IndexState, ResourcePath,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn engine() -> QueryEngine {
        engine_with(IndexAutoCreation::default())
    }

    fn engine_with(index_auto_creation: IndexAutoCreation) -> QueryEngine {
        let user = User::unauthenticated();
        let index_manager = IndexManager::new(&user);
        QueryEngine::with_index_auto_creation(
            LocalDocumentsView::new(
                RemoteDocumentCache::new(),
                MutationQueue::new(&user, index_manager.clone(), Arc::new(EagerReferenceDelegate::new())),
                DocumentOverlayCache::new(&user),
                index_manager,
            ),
            index_auto_creation,
        )
    }

    fn add(txn: &mut PersistenceTransaction<'_>, path: &str, n: i64, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&field("n"), FirestoreValue::from_integer(n));
        let mut document =
            MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data);
        document.set_read_time(SnapshotVersion::from_micros(version));
        RemoteDocumentCache::new()
            .add_entry(txn, &document, SnapshotVersion::from_micros(version))
            .unwrap();
        document
    }

    fn filtered() -> Query {
        Query::new(ResourcePath::from_string("c").unwrap()).with_filter(FieldFilter::new(
            field("n"),
            FilterOperator::GreaterThanOrEqual,
            FirestoreValue::from_integer(2),
        ))
    }

    #[test]
    fn full_scan_without_index_or_previous_results() {
        let engine = engine();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        add(&mut txn, "c/a", 1, 10);
        add(&mut txn, "c/b", 2, 10);
        let results = engine
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::min(), &DocumentKeySet::new())
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/b")]);
    }

    #[test]
    fn previous_results_skip_documents_read_before_limbo_free_version() {
        let engine = engine();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        add(&mut txn, "c/a", 5, 10);
        add(&mut txn, "c/b", 6, 10);
        add(&mut txn, "c/c", 7, 30);

        // Only c/a is known to match as of version 20; c/b was read before and is not a
        // remote key, c/c changed afterwards and is picked up by the remaining-results scan.
        let remote_keys: DocumentKeySet = [key("c/a")].into_iter().collect();
        let results = engine
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::from_micros(20), &remote_keys)
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/a"), key("c/c")]);
    }

    #[test]
    fn index_path_combines_indexed_and_unindexed_documents() {
        let engine = engine();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        let index_manager = engine.local_documents.index_manager().clone();
        index_manager.add_field_index(
            &mut txn,
            &FieldIndex::new(
                FieldIndex::UNKNOWN_ID,
                "c",
                vec![IndexSegment::new(field("n"), IndexKind::Ascending)],
                IndexState::empty(),
            ),
        );
        let indexed = add(&mut txn, "c/a", 3, 10);
        index_manager.update_index_entries(&mut txn, &[(indexed.key().clone(), indexed.clone())].into_iter().collect());
        index_manager.update_collection_group(&mut txn, "c", IndexOffset::from_document(&indexed));
        add(&mut txn, "c/b", 4, 20);
        add(&mut txn, "c/c", 1, 20);

        let results = engine
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::min(), &DocumentKeySet::new())
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/a"), key("c/b")]);
    }

    #[test]
    fn expensive_scans_create_an_index() {
        let engine = engine_with(IndexAutoCreation {
            enabled: true,
            min_collection_size: 0,
            relative_index_read_cost_per_document: 2.0,
        });
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        add(&mut txn, "c/a", 1, 10);
        add(&mut txn, "c/b", 1, 10);
        add(&mut txn, "c/c", 5, 10);
        let target = filtered().to_target();
        let index_manager = engine.local_documents.index_manager().clone();
        assert_eq!(index_manager.get_index_type(&txn, &target), IndexType::None);

        let results = engine
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::min(), &DocumentKeySet::new())
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/c")]);
        assert_eq!(index_manager.get_index_type(&txn, &target), IndexType::Full);
    }

    #[test]
    fn cheap_or_small_scans_create_no_index() {
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        add(&mut txn, "c/a", 1, 10);
        add(&mut txn, "c/b", 3, 10);
        add(&mut txn, "c/c", 5, 10);
        let target = filtered().to_target();

        // Two of three documents match: reading them through an index costs more.
        let cheap = engine_with(IndexAutoCreation {
            enabled: true,
            min_collection_size: 0,
            relative_index_read_cost_per_document: 2.0,
        });
        cheap
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::min(), &DocumentKeySet::new())
            .unwrap();
        assert_eq!(cheap.local_documents.index_manager().get_index_type(&txn, &target), IndexType::None);

        let small = engine_with(IndexAutoCreation {
            enabled: true,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 0.1,
        });
        small
            .get_documents_matching_query(&mut txn, &filtered(), SnapshotVersion::min(), &DocumentKeySet::new())
            .unwrap();
        assert_eq!(small.local_documents.index_manager().get_index_type(&txn, &target), IndexType::None);
    }

    #[test]
    fn limit_edge_with_pending_writes_needs_refill() {
        let query = filtered().with_limit_to_first(1);
        let mut document = MutableDocument::new_found_document(
            key("c/a"),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        );
        let keys: DocumentKeySet = [key("c/a")].into_iter().collect();
        assert!(!needs_refill(&query, &[document.clone()], &keys, SnapshotVersion::from_micros(1)));
        assert!(needs_refill(&query, &[document.clone()], &keys, SnapshotVersion::min()));
        document.set_has_local_mutations();
        assert!(needs_refill(&query, &[document], &keys, SnapshotVersion::from_micros(5)));
        assert!(needs_refill(&query, &[], &keys, SnapshotVersion::from_micros(5)));
    }
}
