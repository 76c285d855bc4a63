use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::schema::{LocalDatabase, RemoteDocumentRecord};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, IndexOffset, MutableDocument, MutableDocumentMap,
    SnapshotVersion,
};
use crate::util::hard_assert;

/// Cache of documents as last confirmed by the backend.
///
/// Every entry carries the read time at which it was written; index backfilling walks the
/// cache in read-time order.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Stores `document` with the given read time, replacing any previous version.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        hard_assert(
            !read_time.is_min(),
            "Cannot add a document to the remote cache with a read time of zero",
        );
        let mut document = document.clone();
        document.set_read_time(read_time);
        let size = serde_json::to_vec(&document)
            .map_err(|err| internal_error(format!("Failed to encode document: {err}")))?
            .len() as i64;

        let key = document.key().clone();
        delete_entry(txn.database, &key);
        index_manager::add_collection_parent(txn.database, &key.collection_path());
        txn.database.remote_document_size += size;
        txn.database
            .remote_documents
            .insert(key, RemoteDocumentRecord { document, size });
        Ok(())
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        delete_entry(txn.database, key);
    }

    /// Cached document for `key`, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        txn.database
            .remote_documents
            .get(key)
            .map(|record| record.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) -> MutableDocumentMap {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    /// Documents directly inside the query's collection that were read after `offset` and
    /// either match the query or have local mutations (`mutated_keys`).
    ///
    /// Every document read after `offset` counts towards `context`, matching or not.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &DocumentKeySet,
        context: Option<&mut QueryContext>,
    ) -> MutableDocumentMap {
        let collection = query.path();
        let read: Vec<(&DocumentKey, &RemoteDocumentRecord)> = txn
            .database
            .remote_documents
            .iter()
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .filter(|(_, record)| IndexOffset::from_document(&record.document) > *offset)
            .collect();
        if let Some(context) = context {
            context.document_read_count += read.len();
        }
        read.into_iter()
            .filter(|(key, record)| mutated_keys.contains(key) || query.matches(&record.document))
            .map(|(key, record)| (key.clone(), record.document.clone()))
            .collect()
    }

    /// Up to `limit` documents of the collection group read after `offset`, in offset order.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> MutableDocumentMap {
        let mut candidates: Vec<(IndexOffset, &MutableDocument)> = txn
            .database
            .remote_documents
            .values()
            .filter(|record| record.document.key().has_collection_id(collection_group))
            .map(|record| (IndexOffset::from_document(&record.document), &record.document))
            .filter(|(document_offset, _)| document_offset > offset)
            .collect();
        candidates.sort_by(|left, right| left.0.cmp(&right.0));
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, document)| (document.key().clone(), document.clone()))
            .collect()
    }

    /// Estimated serialized size of every cached document, in bytes.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_>) -> i64 {
        txn.database.remote_document_size
    }
}

pub(crate) fn delete_entry(database: &mut LocalDatabase, key: &DocumentKey) {
    if let Some(record) = database.remote_documents.remove(key) {
        database.remote_document_size -= record.size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::model::{FieldPath, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, n: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(n), data)
    }

    #[test]
    fn tracks_entries_and_size() {
        let cache = RemoteDocumentCache::new();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);

        assert!(!cache.get_entry(&txn, &key("c/a")).is_valid_document());
        cache
            .add_entry(&mut txn, &doc("c/a", 1), SnapshotVersion::from_micros(5))
            .unwrap();
        let size = cache.get_size(&txn);
        assert!(size > 0);

        cache
            .add_entry(&mut txn, &doc("c/a", 2), SnapshotVersion::from_micros(6))
            .unwrap();
        assert_eq!(cache.get_size(&txn), size);
        let stored = cache.get_entry(&txn, &key("c/a"));
        assert_eq!(stored.read_time(), SnapshotVersion::from_micros(6));

        cache.remove_entry(&mut txn, &key("c/a"));
        assert_eq!(cache.get_size(&txn), 0);
        assert!(database.collection_parents["c"].contains(&ResourcePath::root()));
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn rejects_zero_read_time() {
        let cache = RemoteDocumentCache::new();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache
            .add_entry(&mut txn, &doc("c/a", 1), SnapshotVersion::min())
            .unwrap();
    }

    #[test]
    fn collection_group_reads_are_ordered_and_limited() {
        let cache = RemoteDocumentCache::new();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache.add_entry(&mut txn, &doc("c/b", 1), SnapshotVersion::from_micros(20)).unwrap();
        cache.add_entry(&mut txn, &doc("c/a", 1), SnapshotVersion::from_micros(10)).unwrap();
        cache.add_entry(&mut txn, &doc("x/y/c/z", 1), SnapshotVersion::from_micros(30)).unwrap();
        cache.add_entry(&mut txn, &doc("d/a", 1), SnapshotVersion::from_micros(5)).unwrap();

        let first = cache.get_all_from_collection_group(&txn, "c", &IndexOffset::none(), 2);
        let keys: Vec<_> = first.keys().cloned().collect();
        assert_eq!(keys, vec![key("c/a"), key("c/b")]);

        let after = IndexOffset::new(SnapshotVersion::from_micros(20), key("c/b"), -1);
        let rest = cache.get_all_from_collection_group(&txn, "c", &after, 10);
        assert_eq!(rest.keys().cloned().collect::<Vec<_>>(), vec![key("x/y/c/z")]);
    }

    #[test]
    fn query_reads_include_mutated_keys() {
        let cache = RemoteDocumentCache::new();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        cache.add_entry(&mut txn, &doc("c/a", 1), SnapshotVersion::from_micros(1)).unwrap();
        cache
            .add_entry(
                &mut txn,
                &MutableDocument::new_no_document(key("c/b"), SnapshotVersion::from_micros(1)),
                SnapshotVersion::from_micros(1),
            )
            .unwrap();
        let query = Query::new(ResourcePath::from_string("c").unwrap());
        let plain = cache.get_documents_matching_query(&txn, &query, &IndexOffset::none(), &DocumentKeySet::new(), None);
        assert_eq!(plain.len(), 1);
        let mut mutated = DocumentKeySet::new();
        mutated.insert(key("c/b"));
        let with_mutated = cache.get_documents_matching_query(&txn, &query, &IndexOffset::none(), &mutated, None);
        assert_eq!(with_mutated.len(), 2);

        let mut context = QueryContext::default();
        cache.get_documents_matching_query(&txn, &query, &IndexOffset::none(), &DocumentKeySet::new(), Some(&mut context));
        assert_eq!(context.document_read_count, 2);
    }
}
