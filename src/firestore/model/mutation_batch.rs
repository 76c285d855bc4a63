use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, FieldMask, Mutation,
    MutableDocument, MutationResult,
    OverlayedDocument, SnapshotVersion, Timestamp,
};
use crate::util::hard_assert;

pub type BatchId = i32;

/// Batch id used when no batch applies, for example for remote-only documents.
pub const BATCHID_UNKNOWN: BatchId = -1;

/// Mutations written together by the user, applied atomically.
///
/// `base_mutations` are not sent to the backend. They capture the document state that
/// non-idempotent transforms were computed against so the local view stays stable when the
/// remote document changes underneath.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    #[serde(default)]
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "Cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the backend's results for this batch to the remote copy of `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        let results = &batch_result.mutation_results;
        hard_assert(
            results.len() == self.mutations.len(),
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            ),
        );

        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    /// Applies base mutations then user mutations for `document`'s key to the local view.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and computes the overlay that
    /// reproduces each result.
    ///
    /// Documents in `documents_without_remote_version` never had a remote copy, so their
    /// overlay must be a full set rather than a patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let Some(overlayed) = documents.get_mut(mutation.key()) else {
                continue;
            };
            let previous = overlayed.mutated_fields.take();
            let mut mutated_fields =
                self.apply_to_local_view(&mut overlayed.overlayed_document, previous);
            if documents_without_remote_version.contains(mutation.key()) {
                mutated_fields = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(
                &overlayed.overlayed_document,
                mutated_fields.as_ref(),
            ) {
                overlays.insert(mutation.key().clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.overlayed_document.is_valid_document() {
                overlayed
                    .overlayed_document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// A batch together with the backend's acknowledgement of it.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached according to the backend.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(n: i64) -> MapValue {
        let mut value = MapValue::empty();
        value.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        value
    }

    #[test]
    fn local_view_applies_only_matching_keys() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("c/a"), data(1)), Mutation::set(key("c/b"), data(2))],
        );
        let mut doc = MutableDocument::new_invalid_document(key("c/b"));
        batch.apply_to_local_view(&mut doc, Some(FieldMask::new()));
        assert_eq!(doc.data(), &data(2));
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(key("c/a"))],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("c/a"),
            OverlayedDocument::new(
                MutableDocument::new_found_document(
                    key("c/a"),
                    SnapshotVersion::from_micros(1),
                    data(1),
                ),
                Some(FieldMask::new()),
            ),
        );
        let overlays = batch.apply_to_local_document_set(&mut documents, &DocumentKeySet::new());
        assert!(overlays[&key("c/a")].is_delete());
        assert!(documents[&key("c/a")].overlayed_document.is_no_document());
    }

    #[test]
    fn batch_result_tracks_versions() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("c/a"), data(1))],
        );
        let result = MutationBatchResult::from(
            batch,
            SnapshotVersion::from_micros(10),
            vec![MutationResult::new(SnapshotVersion::from_micros(10))],
            Vec::new(),
        );
        assert_eq!(
            result.doc_versions[&key("c/a")],
            SnapshotVersion::from_micros(10)
        );
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn rejects_empty_batches() {
        MutationBatch::new(1, Timestamp::now(), Vec::new(), Vec::new());
    }
}
