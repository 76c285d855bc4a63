use serde::{Deserialize, Serialize};

use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| values_equal(candidate, needle))
    }
}
