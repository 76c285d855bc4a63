use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path of a single document. Ordered segment by segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments), got '{path}'"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    /// The key that sorts before every real document key.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection directly containing the document.
    pub fn collection_group(&self) -> &str {
        if self.path.len() < 2 {
            return "";
        }
        self.path[self.path.len() - 2].as_str()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.path.len() >= 2 && self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

// Keys are written as strings so they can be used as JSON map keys.
impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.canonical_string())
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(DocumentKey::empty());
        }
        DocumentKey::from_string(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf/landmarks/bridge").unwrap();
        assert_eq!(key.id(), "bridge");
        assert_eq!(key.collection_group(), "landmarks");
        assert_eq!(key.collection_path().canonical_string(), "cities/sf/landmarks");
    }

    #[test]
    fn empty_key_sorts_first() {
        let key = DocumentKey::from_string("a/a").unwrap();
        assert!(DocumentKey::empty() < key);
    }

    #[test]
    fn serializes_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(DocumentKey::from_string("coll/doc").unwrap(), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"coll/doc":1}"#);
        let back: std::collections::BTreeMap<DocumentKey, i32> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
