use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Metadata of a loaded bundle, used to skip bundles that were already applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: String,
    pub version: u32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// A query shipped inside a bundle, together with the read time of its results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

/// One document of a bundle. A missing `document` means the document did not exist at
/// `read_time`.
#[derive(Clone, Debug, PartialEq)]
pub struct BundledDocument {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub document: Option<MutableDocument>,
}

impl BundledDocument {
    pub fn found(document: MutableDocument, read_time: SnapshotVersion) -> Self {
        Self {
            key: document.key().clone(),
            read_time,
            document: Some(document),
        }
    }

    pub fn missing(key: DocumentKey, read_time: SnapshotVersion) -> Self {
        Self {
            key,
            read_time,
            document: None,
        }
    }

    /// The document as the remote document cache stores it, stamped with the bundle's
    /// read time.
    pub fn to_mutable_document(&self) -> MutableDocument {
        let mut document = self
            .document
            .clone()
            .unwrap_or_else(|| MutableDocument::new_no_document(self.key.clone(), self.read_time));
        document.set_read_time(self.read_time);
        document
    }
}

/// Bundle metadata and named queries. Shared by every identity.
#[derive(Clone, Debug, Default)]
pub struct BundleCache;

impl BundleCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_bundle_metadata(&self, txn: &PersistenceTransaction<'_>, bundle_id: &str) -> Option<BundleMetadata> {
        txn.database.bundles.get(bundle_id).cloned()
    }

    pub fn save_bundle_metadata(&self, txn: &mut PersistenceTransaction<'_>, metadata: &BundleMetadata) {
        txn.database
            .bundles
            .insert(metadata.id.clone(), metadata.clone());
    }

    pub fn get_named_query(&self, txn: &PersistenceTransaction<'_>, name: &str) -> Option<NamedQuery> {
        txn.database.named_queries.get(name).cloned()
    }

    pub fn save_named_query(&self, txn: &mut PersistenceTransaction<'_>, query: &NamedQuery) {
        txn.database
            .named_queries
            .insert(query.name.clone(), query.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::schema::LocalDatabase;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn metadata(id: &str, micros: i64) -> BundleMetadata {
        BundleMetadata {
            id: id.to_string(),
            version: 1,
            create_time: SnapshotVersion::from_micros(micros),
            total_documents: 2,
            total_bytes: 100,
        }
    }

    #[test]
    fn saves_metadata_and_named_queries() {
        let cache = BundleCache::new();
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 1);
        assert!(cache.get_bundle_metadata(&txn, "b").is_none());

        cache.save_bundle_metadata(&mut txn, &metadata("b", 5));
        cache.save_bundle_metadata(&mut txn, &metadata("b", 7));
        assert_eq!(
            cache.get_bundle_metadata(&txn, "b").map(|bundle| bundle.create_time),
            Some(SnapshotVersion::from_micros(7))
        );

        let named = NamedQuery {
            name: "rooms".to_string(),
            query: Query::new(ResourcePath::from_string("rooms").unwrap()),
            read_time: SnapshotVersion::from_micros(3),
        };
        cache.save_named_query(&mut txn, &named);
        assert_eq!(cache.get_named_query(&txn, "rooms"), Some(named));
        assert!(cache.get_named_query(&txn, "halls").is_none());
    }

    #[test]
    fn missing_documents_become_deletes_at_the_read_time() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let missing = BundledDocument::missing(key.clone(), SnapshotVersion::from_micros(9));
        let document = missing.to_mutable_document();
        assert!(document.is_no_document());
        assert_eq!(document.version(), SnapshotVersion::from_micros(9));

        let found = BundledDocument::found(
            MutableDocument::new_found_document(key, SnapshotVersion::from_micros(4), MapValue::empty()),
            SnapshotVersion::from_micros(9),
        );
        let document = found.to_mutable_document();
        assert!(document.is_found_document());
        assert_eq!(document.version(), SnapshotVersion::from_micros(4));
        assert_eq!(document.read_time(), SnapshotVersion::from_micros(9));
    }
}
