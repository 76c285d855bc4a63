use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, FieldMask, Mutation, MutableDocument};

/// The net local change for one document: a single mutation that, applied to the remote
/// document, yields the same result as replaying every pending batch that touches it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// A document with its overlay applied, plus the fields the overlay changed.
///
/// `mutated_fields` is `None` when the whole document was replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub overlayed_document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(overlayed_document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            overlayed_document,
            mutated_fields,
        }
    }
}
