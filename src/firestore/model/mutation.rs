use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{values_equal, FirestoreValue, MapValue, ValueKind};
use crate::util::hard_assert;

/// Set of field paths touched by a patch. Ordered so overlays serialize deterministically.
pub type FieldMask = BTreeSet<FieldPath>;

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the masked fields and leaves the rest untouched.
    Patch { value: MapValue, mask: FieldMask },
    Delete,
}

/// A single-document write as issued by the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    #[serde(default)]
    precondition: Precondition,
    #[serde(default)]
    field_transforms: Vec<FieldTransform>,
}

/// Outcome of a mutation as acknowledged by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    #[serde(default)]
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }

    pub fn with_transform_results(mut self, results: Vec<FirestoreValue>) -> Self {
        self.transform_results = results;
        self
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch with the usual `exists: true` precondition of document updates.
    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { value, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_field_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, MutationKind::Delete)
    }

    /// Fields written by a patch, or `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask),
            _ => None,
        }
    }

    /// Applies the acknowledged result of this mutation to the remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) {
        self.verify_key_matches(document);
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results =
                    self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The write was accepted but we cannot tell what it produced.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    self.server_transform_results(document, &result.transform_results);
                let mut data = document.data().clone();
                data.set_all(patch_entries(value, mask));
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
        }
    }

    /// Applies this mutation to the local view of `document`.
    ///
    /// `previous_mask` holds the fields changed by earlier mutations on the same document;
    /// `None` means the whole document has already been replaced. Returns the accumulated
    /// mask after this mutation.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key_matches(document);
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                data.set_all(patch_entries(value, mask));
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();

                let mut merged = previous_mask?;
                merged.extend(mask.iter().cloned());
                merged.extend(self.field_transforms.iter().map(|t| t.field().clone()));
                Some(merged)
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
        }
    }

    /// Values that non-idempotent transforms need to be re-applied on top of a remote
    /// document, or `None` when the mutation has no such transforms.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        let mut found = false;
        for transform in &self.field_transforms {
            let existing = document.field(transform.field());
            if let Some(value) = transform_base_value(transform.operation(), existing) {
                base.set(transform.field(), value);
                found = true;
            }
        }
        found.then_some(base)
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        hard_assert(
            self.field_transforms.len() == server_results.len(),
            format!(
                "server transform result count ({}) should match field transform count ({})",
                server_results.len(),
                self.field_transforms.len()
            ),
        );

        let mut results = BTreeMap::new();
        for (transform, server_value) in self.field_transforms.iter().zip(server_results) {
            let previous = document.field(transform.field()).cloned();
            let value = match transform.operation() {
                TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
                TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
                _ => server_value.clone(),
            };
            results.insert(transform.field().clone(), Some(value));
        }
        results
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        let mut results = BTreeMap::new();
        for transform in &self.field_transforms {
            let previous = document.field(transform.field()).cloned();
            let value = match transform.operation() {
                TransformOperation::ServerTimestamp => {
                    FirestoreValue::from_timestamp(local_write_time)
                }
                TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
                TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
                TransformOperation::NumericIncrement(operand) => {
                    numeric_increment(previous.as_ref(), operand)
                }
            };
            results.insert(transform.field().clone(), Some(value));
        }
        results
    }

    fn verify_key_matches(&self, document: &MutableDocument) {
        hard_assert(
            &self.key == document.key(),
            format!(
                "Can only apply a mutation to a document with the same key ({} != {})",
                self.key,
                document.key()
            ),
        );
    }
}

/// Builds the mutation that reproduces the local changes recorded on `document`.
///
/// Returns `None` when the document has no local mutations or when an empty mask says
/// nothing changed. A missing mask produces a full set (or delete).
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut patch_mask = FieldMask::new();
    for original in mask {
        let mut path = original.clone();
        if patch_mask.contains(&path) {
            continue;
        }
        let mut value = data.get(&path).cloned();
        // A deleted nested field becomes a write of its parent map.
        if value.is_none() {
            if let Some(parent) = path.pop_last() {
                value = data.get(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        patch_mask.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch, patch_mask)
            .with_precondition(Precondition::None),
    )
}

fn patch_entries(value: &MapValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.iter()
        .map(|path| (path.clone(), value.get(path).cloned()))
        .collect()
}

fn transform_base_value(
    operation: &TransformOperation,
    existing: Option<&FirestoreValue>,
) -> Option<FirestoreValue> {
    match operation {
        TransformOperation::NumericIncrement(_) => match existing {
            Some(value) if value.is_number() => Some(value.clone()),
            _ => Some(FirestoreValue::from_integer(0)),
        },
        _ => None,
    }
}

fn array_elements(existing: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match existing {
        Some(value) => match value.kind() {
            ValueKind::Array(array) => array.values().to_vec(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn array_union(existing: Option<FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = array_elements(existing);
    for element in additions {
        if !values
            .iter()
            .any(|candidate| values_equal(candidate, element))
        {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let filtered = array_elements(existing)
        .into_iter()
        .filter(|candidate| {
            !removals
                .iter()
                .any(|needle| values_equal(needle, candidate))
        })
        .collect();
    FirestoreValue::from_array(filtered)
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match existing {
        Some(value) if value.is_number() => value.kind().clone(),
        _ => ValueKind::Integer(0),
    };
    match (base, operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current as f64 + *delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + *delta)
        }
        // Non-numeric operands are rejected when the write is built; keep the base value.
        (base, _) => match base {
            ValueKind::Double(current) => FirestoreValue::from_double(current),
            ValueKind::Integer(current) => FirestoreValue::from_integer(current),
            _ => FirestoreValue::from_integer(0),
        },
    }
}
