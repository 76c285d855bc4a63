use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::TargetId;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, SnapshotVersion};

/// Aggregated result of applying a batch of watch responses, as handed to the local store.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match and whose resume token must be reset.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            ..Self::default()
        }
    }

    pub fn with_target_change(mut self, target_id: TargetId, change: TargetChange) -> Self {
        self.target_changes.insert(target_id, change);
        self
    }

    pub fn with_document_update(mut self, document: MutableDocument) -> Self {
        self.document_updates
            .insert(document.key().clone(), document);
        self
    }

    pub fn with_target_mismatch(mut self, target_id: TargetId) -> Self {
        self.target_mismatches.insert(target_id);
        self
    }

    pub fn with_resolved_limbo_document(mut self, key: DocumentKey) -> Self {
        self.resolved_limbo_documents.insert(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target membership changes and resume state carried by a remote event.
#[derive(Debug, Clone, Default)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn new(resume_token: Vec<u8>, current: bool) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn with_added(mut self, key: DocumentKey) -> Self {
        self.added_documents.insert(key);
        self
    }

    pub fn with_modified(mut self, key: DocumentKey) -> Self {
        self.modified_documents.insert(key);
        self
    }

    pub fn with_removed(mut self, key: DocumentKey) -> Self {
        self.removed_documents.insert(key);
        self
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_populate_event() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let event = RemoteEvent::new(SnapshotVersion::from_micros(20))
            .with_target_change(2, TargetChange::new(vec![1], true).with_added(key.clone()))
            .with_document_update(MutableDocument::new_no_document(
                key.clone(),
                SnapshotVersion::from_micros(20),
            ));
        assert!(!event.is_empty());
        assert!(event.target_changes[&2].has_document_changes());
        assert!(event.document_updates.contains_key(&key));
        assert!(RemoteEvent::default().is_empty());
    }
}
