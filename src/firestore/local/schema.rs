use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::{TargetData, TargetId};
use crate::firestore::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::firestore::local::primary_lease::{ClientMetadataRecord, PrimaryLeaseRecord};
use crate::firestore::local::ListenSequenceNumber;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, IndexState, MutableDocument, MutationBatch, Overlay,
    ResourcePath, SnapshotVersion, BATCHID_UNKNOWN,
};
use crate::firestore::value::FirestoreValue;

/// Copy-on-write map that remembers which keys were written since it was last marked clean.
///
/// Cloning shares the rows, so a transaction can work on a copy of the image and only pay
/// for the rows it touches. The durable persistence writes back exactly the recorded keys.
///
/// Reads go through `Deref<Target = BTreeMap>`. There is no `DerefMut`: every write goes
/// through a method that records the key.
pub struct Table<K, V> {
    rows: Arc<BTreeMap<K, V>>,
    dirty: BTreeSet<K>,
    /// Whether `dirty` covers every difference from the last clean state. Tables built from
    /// scratch start untracked and are compared row by row instead.
    tracked: bool,
}

impl<K: Ord + Clone, V: Clone> Table<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows_mut(&mut self) -> &mut BTreeMap<K, V> {
        Arc::make_mut(&mut self.rows)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.dirty.insert(key.clone());
        self.rows_mut().insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.rows.contains_key(key) {
            return None;
        }
        self.dirty.insert(key.clone());
        self.rows_mut().remove(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.rows.contains_key(key) {
            return None;
        }
        self.dirty.insert(key.clone());
        self.rows_mut().get_mut(key)
    }

    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.dirty.insert(key.clone());
        self.rows_mut().entry(key).or_default()
    }

    pub fn clear(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        self.dirty.extend(self.rows.keys().cloned());
        self.rows = Arc::new(BTreeMap::new());
    }

    /// True when both tables still point at the same rows, i.e. neither was written since
    /// one was cloned from the other.
    pub(crate) fn shares_rows_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rows, &other.rows)
    }

    /// Keys written since the table was last marked clean, or `None` when the table was not
    /// derived from a clean state and must be compared in full.
    pub(crate) fn dirty_keys(&self) -> Option<&BTreeSet<K>> {
        self.tracked.then_some(&self.dirty)
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty.clear();
        self.tracked = true;
    }

    /// Marks the table clean and runs `clean` over every row that may hold dirty state of
    /// its own.
    pub(crate) fn mark_clean_with(&mut self, mut clean: impl FnMut(&mut V)) {
        let dirty = std::mem::take(&mut self.dirty);
        if !self.tracked {
            if !self.rows.is_empty() {
                self.rows_mut().values_mut().for_each(&mut clean);
            }
        } else if !dirty.is_empty() {
            let rows = self.rows_mut();
            for key in &dirty {
                if let Some(value) = rows.get_mut(key) {
                    clean(value);
                }
            }
        }
        self.tracked = true;
    }
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: Arc::new(BTreeMap::new()),
            dirty: BTreeSet::new(),
            tracked: false,
        }
    }
}

impl<K: Clone, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            dirty: self.dirty.clone(),
            tracked: self.tracked,
        }
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}

impl<K: Debug, V: Debug> Debug for Table<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.rows.iter()).finish()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for Table<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rows, &other.rows) || self.rows == other.rows
    }
}

impl<K, V> From<BTreeMap<K, V>> for Table<K, V> {
    fn from(rows: BTreeMap<K, V>) -> Self {
        Self {
            rows: Arc::new(rows),
            ..Self::default()
        }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for Table<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<BTreeMap<K, V>>())
    }
}

impl<'a, K, V> IntoIterator for &'a Table<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = btree_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// The complete storage image.
///
/// Kept whole in memory by the in-memory persistence and cached by the durable one, which
/// stores every table as rows of its own. Per-identity data is keyed by
/// [`User::storage_key`](crate::firestore::core::User::storage_key).
#[derive(Clone, Debug, Default)]
pub struct LocalDatabase {
    pub mutation_queues: Table<String, MutationQueueRecord>,
    /// Largest batch id ever handed out, across every identity.
    pub last_batch_id: BatchId,
    pub overlays: Table<String, Table<DocumentKey, Overlay>>,
    pub remote_documents: Table<DocumentKey, RemoteDocumentRecord>,
    pub remote_document_size: i64,
    pub targets: Table<TargetId, TargetData>,
    pub target_global: TargetGlobal,
    pub target_documents: Table<TargetId, Table<DocumentKey, ()>>,
    /// Last sequence number at which each document was referenced.
    pub document_sequence_numbers: Table<DocumentKey, ListenSequenceNumber>,
    pub field_indexes: Table<i32, FieldIndex>,
    pub index_states: Table<String, Table<i32, IndexState>>,
    pub index_entries: Table<String, Table<i32, Table<DocumentKey, Vec<IndexEntry>>>>,
    /// Collection id to the parent paths it has been seen under.
    pub collection_parents: Table<String, BTreeSet<ResourcePath>>,
    pub primary_lease: Option<PrimaryLeaseRecord>,
    pub client_metadata: Table<String, ClientMetadataRecord>,
    pub bundles: Table<String, BundleMetadata>,
    pub named_queries: Table<String, NamedQuery>,
}

impl LocalDatabase {
    /// True when any identity has a queued batch touching `key`.
    pub(crate) fn mutation_queues_contain_key(&self, key: &DocumentKey) -> bool {
        self.mutation_queues
            .values()
            .any(|queue| queue.document_mutations.contains_key(key))
    }

    pub(crate) fn target_documents_contain_key(&self, key: &DocumentKey) -> bool {
        self.target_documents.values().any(|keys| keys.contains_key(key))
    }

    /// Forgets which rows were written. Called once a transaction's image has replaced the
    /// previous one.
    pub(crate) fn mark_clean(&mut self) {
        self.mutation_queues.mark_clean_with(|queue| {
            queue.batches.mark_clean();
            queue.document_mutations.mark_clean();
        });
        self.overlays.mark_clean_with(Table::mark_clean);
        self.remote_documents.mark_clean();
        self.targets.mark_clean();
        self.target_documents.mark_clean_with(Table::mark_clean);
        self.document_sequence_numbers.mark_clean();
        self.field_indexes.mark_clean();
        self.index_states.mark_clean_with(Table::mark_clean);
        self.index_entries
            .mark_clean_with(|indexes| indexes.mark_clean_with(Table::mark_clean));
        self.collection_parents.mark_clean();
        self.client_metadata.mark_clean();
        self.bundles.mark_clean();
        self.named_queries.mark_clean();
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationQueueRecord {
    pub metadata: MutationQueueMetadata,
    pub batches: Table<BatchId, MutationBatch>,
    /// Per-document index: key to the ids of batches that write it.
    pub document_mutations: Table<DocumentKey, BTreeSet<BatchId>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationQueueMetadata {
    pub last_acknowledged_batch_id: BatchId,
    #[serde(with = "bytes_as_base64")]
    pub last_stream_token: Vec<u8>,
}

impl Default for MutationQueueMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged_batch_id: BATCHID_UNKNOWN,
            last_stream_token: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocumentRecord {
    pub document: MutableDocument,
    /// Serialized size of `document`, kept so removal can adjust the cache size.
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// One row of a field index: the document's values for the directional segments, plus the
/// array element for `contains` segments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub array_value: Option<FirestoreValue>,
    pub directional_values: Vec<FirestoreValue>,
}

mod bytes_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn clones_share_rows_until_written() {
        let mut original: Table<i32, &str> = Table::new();
        original.insert(1, "a");
        original.mark_clean();

        let mut copy = original.clone();
        assert!(copy.shares_rows_with(&original));
        assert!(copy.dirty_keys().unwrap().is_empty());

        copy.insert(2, "b");
        assert!(!copy.shares_rows_with(&original));
        assert_eq!(original.len(), 1);
        assert_eq!(copy.dirty_keys().unwrap().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn writes_record_their_keys() {
        let mut table: Table<i32, i32> = Table::new();
        table.insert(1, 10);
        table.insert(2, 20);
        table.mark_clean();

        assert!(table.get_mut(&3).is_none());
        assert!(table.remove(&4).is_none());
        assert!(table.dirty_keys().unwrap().is_empty());

        *table.get_mut(&1).unwrap() += 1;
        table.remove(&2);
        *table.entry_or_default(5) += 50;
        assert_eq!(
            table.dirty_keys().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 5]
        );
        assert_eq!(table[&1], 11);
        assert_eq!(table[&5], 50);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.dirty_keys().unwrap().len(), 3);
    }

    #[test]
    fn fresh_tables_are_untracked() {
        let table: Table<i32, i32> = [(1, 1)].into_iter().collect();
        assert!(table.dirty_keys().is_none());
    }

    #[test]
    fn mark_clean_reaches_nested_tables() {
        let mut database = LocalDatabase::default();
        database
            .target_documents
            .entry_or_default(1)
            .insert(key("rooms/a"), ());
        database.mark_clean();
        assert!(database.target_documents.dirty_keys().unwrap().is_empty());
        assert!(database.target_documents[&1].dirty_keys().unwrap().is_empty());
        assert!(database.target_documents_contain_key(&key("rooms/a")));
    }

    #[test]
    fn queue_metadata_defaults() {
        let metadata: MutationQueueMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(metadata.last_acknowledged_batch_id, BATCHID_UNKNOWN);
        assert!(metadata.last_stream_token.is_empty());

        let json = serde_json::to_string(&MutationQueueMetadata {
            last_acknowledged_batch_id: 3,
            last_stream_token: vec![1, 2, 3],
        })
        .unwrap();
        let restored: MutationQueueMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.last_stream_token, vec![1, 2, 3]);
    }
}
