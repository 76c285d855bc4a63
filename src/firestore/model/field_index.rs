use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::local::ListenSequenceNumber;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp, BATCHID_UNKNOWN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexKind {
    Ascending,
    Descending,
    /// Array membership, used by `array-contains` filters.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache up to which an index has been backfilled.
///
/// Offsets order by read time, then document key, then batch id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn new(read_time: SnapshotVersion, document_key: DocumentKey, largest_batch_id: BatchId) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// The offset before every document.
    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), DocumentKey::empty(), BATCHID_UNKNOWN)
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self::new(document.read_time(), document.key().clone(), BATCHID_UNKNOWN)
    }

    /// Offset immediately after every document read at `read_time`.
    pub fn create_successor(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        let timestamp = read_time.timestamp();
        let successor = Timestamp::new(timestamp.seconds, timestamp.nanos + 1);
        Self::new(
            SnapshotVersion::new(successor),
            DocumentKey::empty(),
            largest_batch_id,
        )
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Listen sequence number of the last backfill pass that touched this index.
    pub sequence_number: ListenSequenceNumber,
    pub offset: IndexOffset,
}

impl IndexState {
    pub const INITIAL_SEQUENCE_NUMBER: ListenSequenceNumber = 0;

    pub fn new(sequence_number: ListenSequenceNumber, offset: IndexOffset) -> Self {
        Self {
            sequence_number,
            offset,
        }
    }

    pub fn empty() -> Self {
        Self::new(Self::INITIAL_SEQUENCE_NUMBER, IndexOffset::none())
    }
}

impl Default for IndexState {
    fn default() -> Self {
        Self::empty()
    }
}

/// A client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub const UNKNOWN_ID: i32 = -1;

    pub fn new(
        index_id: i32,
        collection_group: impl Into<String>,
        segments: Vec<IndexSegment>,
        index_state: IndexState,
    ) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
            index_state,
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> Vec<&IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
            .collect()
    }

    /// Compares the definition of two indexes, ignoring id and backfill state.
    pub fn semantic_cmp(&self, other: &Self) -> Ordering {
        self.collection_group
            .cmp(&other.collection_group)
            .then_with(|| self.segments.cmp(&other.segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let key_a = DocumentKey::from_string("c/a").unwrap();
        let key_b = DocumentKey::from_string("c/b").unwrap();
        let early = IndexOffset::new(SnapshotVersion::from_micros(1), key_b.clone(), 5);
        let late = IndexOffset::new(SnapshotVersion::from_micros(2), key_a.clone(), -1);
        assert!(early < late);
        assert!(IndexOffset::none() < early);
        let same_time = IndexOffset::new(SnapshotVersion::from_micros(1), key_a, 9);
        assert!(same_time < early);
    }

    #[test]
    fn successor_skips_read_time() {
        let version = SnapshotVersion::new(Timestamp::new(1, 999_999_999));
        let successor = IndexOffset::create_successor(version, 4);
        assert_eq!(successor.read_time, SnapshotVersion::new(Timestamp::new(2, 0)));
        assert!(successor.document_key.is_empty());
        assert_eq!(successor.largest_batch_id, 4);
    }

    #[test]
    fn splits_segments() {
        let index = FieldIndex::new(
            1,
            "rooms",
            vec![
                IndexSegment::new(FieldPath::from_dot_separated("tags").unwrap(), IndexKind::Contains),
                IndexSegment::new(FieldPath::from_dot_separated("n").unwrap(), IndexKind::Ascending),
            ],
            IndexState::empty(),
        );
        assert_eq!(index.array_segment().unwrap().kind, IndexKind::Contains);
        assert_eq!(index.directional_segments().len(), 1);
    }
}
