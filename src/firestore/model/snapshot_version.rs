use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Version of a document or of a watch snapshot, as assigned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// The version used for documents that were never read from the backend.
    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::from_micros(micros))
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}
