use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentType {
    /// Placeholder for a key the cache knows nothing about.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document was written by an acknowledged mutation whose result is not known.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document together with the metadata the local store tracks for it.
///
/// The same value moves through several states: a cache miss is an `Invalid` document that
/// may later be converted in place once a mutation or a watch update is applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type DocumentKeySet = BTreeSet<DocumentKey>;

impl MutableDocument {
    fn with_type(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        data: MapValue,
        document_state: DocumentState,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::min(),
            data,
            document_state,
        }
    }

    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::with_type(
            key,
            DocumentType::Invalid,
            SnapshotVersion::min(),
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::with_type(
            key,
            DocumentType::FoundDocument,
            version,
            data,
            DocumentState::Synced,
        )
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(
            key,
            DocumentType::NoDocument,
            version,
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(
            key,
            DocumentType::UnknownDocument,
            version,
            MapValue::empty(),
            DocumentState::HasCommittedMutations,
        )
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: MapValue,
    ) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

impl Display for MutableDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Document({}, {}, {:?}, {:?})",
            self.key, self.version, self.document_type, self.document_state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    #[test]
    fn invalid_document_is_not_valid() {
        let doc = MutableDocument::new_invalid_document(key());
        assert!(!doc.is_valid_document());
        assert!(doc.version().is_min());
        assert!(!doc.has_pending_writes());
    }

    #[test]
    fn conversions_update_state() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(1));
        doc.convert_to_found_document(SnapshotVersion::from_micros(5), MapValue::new(fields))
            .set_has_local_mutations();
        assert!(doc.is_found_document());
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());

        doc.convert_to_no_document(SnapshotVersion::from_micros(7));
        assert!(doc.is_no_document());
        assert!(doc.data().is_empty());
        assert!(!doc.has_pending_writes());
    }

    #[test]
    fn unknown_document_has_committed_mutations() {
        let doc = MutableDocument::new_unknown_document(key(), SnapshotVersion::from_micros(3));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }
}
