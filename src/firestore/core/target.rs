use serde::{Deserialize, Serialize};

use crate::firestore::core::{Bound, FieldFilter, OrderBy};
use crate::firestore::local::ListenSequenceNumber;
use crate::firestore::model::{DocumentKey, ResourcePath, SnapshotVersion};

pub type TargetId = i32;

/// A normalized query as the backend sees it. Two queries that only differ in how the
/// limit is applied share a target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    #[serde(default)]
    pub collection_group: Option<String>,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub start_at: Option<Bound>,
    #[serde(default)]
    pub end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::from_path(self.path.clone()).is_ok()
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection group the target reads from.
    pub fn collection_group(&self) -> String {
        match &self.collection_group {
            Some(group) => group.clone(),
            None => self.path.last_segment().unwrap_or_default().to_string(),
        }
    }

    /// Canonical string shared by every equivalent target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetPurpose {
    /// A regular, user-initiated listen.
    Listen,
    /// Re-listen after the backend reported a different document count.
    ExistenceFilterMismatch,
    /// Resolution of a document the client is unsure about.
    LimboResolution,
}

/// Everything the local store remembers about an active or cached target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target was last known to have no limbo documents. Queries can
    /// trust the cached results up to this version.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(default, with = "resume_token")]
    pub resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_resume_token(
        mut self,
        resume_token: Vec<u8>,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

// Resume tokens are opaque bytes; keep them readable in the JSON image.
mod resume_token {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(token: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(token))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;

    #[test]
    fn equivalent_queries_share_canonical_id() {
        let a = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let b = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        assert_eq!(a.canonical_id(), b.canonical_id());
        let c = Query::new(ResourcePath::from_string("halls").unwrap()).to_target();
        assert_ne!(a.canonical_id(), c.canonical_id());
    }

    #[test]
    fn target_data_round_trips_resume_token() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![9, 8, 7], SnapshotVersion::from_micros(5));
        let json = serde_json::to_string(&data).unwrap();
        let back: TargetData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }
}
