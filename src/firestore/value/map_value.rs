use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Document contents: a tree of named values addressed by [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value stored at `path`, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with empty maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_value_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        remove_value_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of writes; `None` entries delete the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Paths of every leaf value. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> BTreeSet<FieldPath> {
        let mut mask = BTreeSet::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut mask);
        mask
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    mask: &mut BTreeSet<FieldPath>,
) {
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.fields.is_empty() => {
                collect_leaf_paths(&child.fields, prefix, mask);
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    mask.insert(path);
                }
            }
        }
        prefix.pop();
    }
}

fn set_value_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));

    let mut child_fields = match entry.kind() {
        ValueKind::Map(map) => map.fields().clone(),
        _ => BTreeMap::new(),
    };

    set_value_at_segments(&mut child_fields, rest, value);
    *entry = FirestoreValue::from_map(child_fields);
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(value) = fields.get_mut(first) {
        if let ValueKind::Map(child_map) = value.kind() {
            let mut child_fields = child_map.fields().clone();
            remove_value_at_segments(&mut child_fields, rest);
            *value = FirestoreValue::from_map(child_fields);
        }
    }
}
