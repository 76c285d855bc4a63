mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use document::{
    DocumentKeySet, DocumentMap, DocumentState, DocumentType, MutableDocument, MutableDocumentMap,
};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexOffset, IndexSegment, IndexState};
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind,
    MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCHID_UNKNOWN};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
