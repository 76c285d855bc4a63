use std::collections::BTreeSet;

use crate::firestore::core::{Direction, FieldFilter, FilterOperator, OrderBy, Target, User};
use crate::firestore::local::persistence::{ListenSequenceNumber, PersistenceTransaction};
use crate::firestore::local::schema::{IndexEntry, LocalDatabase};
use crate::firestore::model::{
    DocumentKey, DocumentMap, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment,
    IndexState, MutableDocument, ResourcePath, SnapshotVersion,
};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No index can be used.
    None,
    /// An index narrows the candidates; the result still needs filtering.
    Partial,
    /// An index covers every filter and order-by of the target.
    Full,
}

/// Field index configuration, per-identity backfill state and index entries, plus the
/// collection-parent index used by collection group queries.
#[derive(Clone, Debug)]
pub struct IndexManager {
    user_key: String,
}

impl IndexManager {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key(),
        }
    }

    /// Records that `collection_path` exists so collection group queries can find it.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_path: &ResourcePath,
    ) {
        add_collection_parent(txn.database, collection_path);
    }

    /// Every parent path under which a collection named `collection_id` was seen.
    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_id: &str,
    ) -> Vec<ResourcePath> {
        txn.database
            .collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a new index definition and returns it with its assigned id.
    pub fn add_field_index(&self, txn: &mut PersistenceTransaction<'_>, index: &FieldIndex) -> FieldIndex {
        let database = &mut *txn.database;
        let index_id = database
            .field_indexes
            .keys()
            .next_back()
            .map_or(1, |highest| highest + 1);
        let stored = FieldIndex::new(
            index_id,
            index.collection_group.clone(),
            index.segments.clone(),
            IndexState::empty(),
        );
        database.field_indexes.insert(index_id, stored.clone());
        database
            .index_states
            .entry_or_default(self.user_key.clone())
            .insert(index_id, index.index_state.clone());
        log::debug!("Added field index {index_id} on {}", index.collection_group);
        FieldIndex {
            index_state: index.index_state.clone(),
            ..stored
        }
    }

    /// Removes the index definition together with its state and entries for every identity.
    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index: &FieldIndex) {
        let database = &mut *txn.database;
        database.field_indexes.remove(&index.index_id);
        let users: Vec<String> = database.index_states.keys().cloned().collect();
        for user in users {
            if let Some(states) = database.index_states.get_mut(&user) {
                states.remove(&index.index_id);
            }
        }
        let users: Vec<String> = database.index_entries.keys().cloned().collect();
        for user in users {
            if let Some(entries) = database.index_entries.get_mut(&user) {
                entries.remove(&index.index_id);
            }
        }
    }

    pub fn delete_all_field_indexes(&self, txn: &mut PersistenceTransaction<'_>) {
        let database = &mut *txn.database;
        database.field_indexes.clear();
        database.index_states.clear();
        database.index_entries.clear();
    }

    /// Configured indexes with this identity's backfill state, optionally limited to one
    /// collection group.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> Vec<FieldIndex> {
        let states = txn.database.index_states.get(&self.user_key);
        txn.database
            .field_indexes
            .values()
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .map(|index| {
                let state = states
                    .and_then(|states| states.get(&index.index_id))
                    .cloned()
                    .unwrap_or_default();
                FieldIndex {
                    index_state: state,
                    ..index.clone()
                }
            })
            .collect()
    }

    /// The index with the most segments that can serve `target`.
    pub fn get_field_index(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<FieldIndex> {
        if target.is_document_target() {
            return None;
        }
        let matcher = TargetIndexMatcher::new(target);
        self.get_field_indexes(txn, Some(&target.collection_group()))
            .into_iter()
            .filter(|index| matcher.serves(index))
            .max_by(|left, right| {
                left.segments
                    .len()
                    .cmp(&right.segments.len())
                    .then_with(|| right.index_id.cmp(&left.index_id))
            })
    }

    /// Adds an index that fully serves `target` unless one already does.
    pub fn create_target_indexes(&self, txn: &mut PersistenceTransaction<'_>, target: &Target) {
        if target.is_document_target() || self.get_index_type(txn, target) == IndexType::Full {
            return;
        }
        if let Some(index) = TargetIndexMatcher::new(target).build_target_index() {
            log::debug!("Creating index on {} for {}", index.collection_group, target.canonical_id());
            self.add_field_index(txn, &index);
        }
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> IndexType {
        match self.get_field_index(txn, target) {
            None => IndexType::None,
            Some(index) if index.segments.len() < target_segment_count(target) => IndexType::Partial,
            Some(_) => IndexType::Full,
        }
    }

    /// Keys whose index entries satisfy every filter the index covers, or `None` when no
    /// index serves the target. Filters outside the index are left to the caller.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> Option<BTreeSet<DocumentKey>> {
        let index = self.get_field_index(txn, target)?;
        let indexed_fields: BTreeSet<&FieldPath> = index
            .segments
            .iter()
            .map(|segment| &segment.field_path)
            .collect();
        let filters: Vec<&FieldFilter> = target
            .filters
            .iter()
            .filter(|filter| filter.field().is_key_field() || indexed_fields.contains(filter.field()))
            .collect();

        let Some(entries) = txn
            .database
            .index_entries
            .get(&self.user_key)
            .and_then(|by_index| by_index.get(&index.index_id))
        else {
            return Some(BTreeSet::new());
        };

        let keys = entries
            .iter()
            .filter(|(key, rows)| {
                rows.iter().any(|row| {
                    let projected = project_entry(&index, key, row);
                    filters.iter().all(|filter| filter.matches(&projected))
                })
            })
            .map(|(key, _)| key.clone())
            .collect();
        Some(keys)
    }

    /// Smallest backfill offset among the indexes serving `target`.
    pub fn get_min_offset(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> IndexOffset {
        let indexes: Vec<FieldIndex> = self.get_field_index(txn, target).into_iter().collect();
        min_offset(&indexes)
    }

    pub fn get_min_offset_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
    ) -> IndexOffset {
        min_offset(&self.get_field_indexes(txn, Some(collection_group)))
    }

    /// Collection group of the least recently backfilled index. Ties go to the older index.
    pub fn get_next_collection_group_to_update(&self, txn: &PersistenceTransaction<'_>) -> Option<String> {
        self.get_field_indexes(txn, None)
            .into_iter()
            .min_by(|left, right| {
                left.index_state
                    .sequence_number
                    .cmp(&right.index_state.sequence_number)
                    .then_with(|| left.index_id.cmp(&right.index_id))
            })
            .map(|index| index.collection_group)
    }

    /// Advances every index of the group to `offset` and marks it as most recently updated.
    ///
    /// An index that is already past `offset` keeps its own offset.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
    ) {
        let sequence_number = self.next_sequence_number(txn);
        let current: Vec<(i32, IndexOffset)> = self
            .get_field_indexes(txn, Some(collection_group))
            .into_iter()
            .map(|index| (index.index_id, index.index_state.offset))
            .collect();
        let states = txn.database.index_states.entry_or_default(self.user_key.clone());
        for (index_id, existing) in current {
            let advanced = existing.max(offset.clone());
            states.insert(index_id, IndexState::new(sequence_number, advanced));
        }
    }

    /// Rewrites the index entries of every document in `documents`.
    pub fn update_index_entries(&self, txn: &mut PersistenceTransaction<'_>, documents: &DocumentMap) {
        for document in documents.values() {
            let group = document.key().collection_group().to_string();
            for index in self.get_field_indexes(txn, Some(&group)) {
                let rows = compute_index_entries(&index, document);
                write_entries(txn.database, &self.user_key, index.index_id, document.key(), rows);
            }
        }
    }

    fn next_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> ListenSequenceNumber {
        txn.database
            .index_states
            .get(&self.user_key)
            .and_then(|states| states.values().map(|state| state.sequence_number).max())
            .unwrap_or(IndexState::INITIAL_SEQUENCE_NUMBER)
            + 1
    }
}

pub(crate) fn add_collection_parent(database: &mut LocalDatabase, collection_path: &ResourcePath) {
    let Some(collection_id) = collection_path.last_segment() else {
        return;
    };
    let parent = collection_path.without_last();
    if database
        .collection_parents
        .get(collection_id)
        .is_some_and(|parents| parents.contains(&parent))
    {
        return;
    }
    database
        .collection_parents
        .entry_or_default(collection_id.to_string())
        .insert(parent);
}

fn write_entries(
    database: &mut LocalDatabase,
    user_key: &str,
    index_id: i32,
    key: &DocumentKey,
    rows: Vec<IndexEntry>,
) {
    let stored = database
        .index_entries
        .get(user_key)
        .and_then(|by_index| by_index.get(&index_id))
        .and_then(|entries| entries.get(key));
    if stored.map_or(rows.is_empty(), |stored| *stored == rows) {
        return;
    }
    let entries = database
        .index_entries
        .entry_or_default(user_key.to_string())
        .entry_or_default(index_id);
    if rows.is_empty() {
        entries.remove(key);
    } else {
        entries.insert(key.clone(), rows);
    }
}

fn min_offset(indexes: &[FieldIndex]) -> IndexOffset {
    let Some(mut offset) = indexes
        .iter()
        .map(|index| index.index_state.offset.clone())
        .min()
    else {
        return IndexOffset::none();
    };
    offset.largest_batch_id = indexes
        .iter()
        .map(|index| index.index_state.offset.largest_batch_id)
        .max()
        .unwrap_or(offset.largest_batch_id);
    offset
}

/// One row per document, or per array element when the index has a `contains` segment.
/// Documents missing an indexed field are not indexed.
fn compute_index_entries(index: &FieldIndex, document: &MutableDocument) -> Vec<IndexEntry> {
    if !document.is_found_document() {
        return Vec::new();
    }
    let mut directional_values = Vec::new();
    for segment in index.directional_segments() {
        match document.field(&segment.field_path) {
            Some(value) => directional_values.push(value.clone()),
            None => return Vec::new(),
        }
    }
    match index.array_segment() {
        None => vec![IndexEntry {
            array_value: None,
            directional_values,
        }],
        Some(segment) => match document.field(&segment.field_path).map(FirestoreValue::kind) {
            Some(ValueKind::Array(array)) => array
                .values()
                .iter()
                .map(|element| IndexEntry {
                    array_value: Some(element.clone()),
                    directional_values: directional_values.clone(),
                })
                .collect(),
            _ => Vec::new(),
        },
    }
}

/// Rebuilds a document holding only the indexed values of one entry so that the target's
/// own filters can be evaluated against it.
fn project_entry(index: &FieldIndex, key: &DocumentKey, entry: &IndexEntry) -> MutableDocument {
    let mut data = MapValue::empty();
    for (segment, value) in index.directional_segments().into_iter().zip(&entry.directional_values) {
        data.set(&segment.field_path, value.clone());
    }
    if let (Some(segment), Some(element)) = (index.array_segment(), &entry.array_value) {
        data.set(
            &segment.field_path,
            FirestoreValue::from_array(vec![element.clone()]),
        );
    }
    let mut document = MutableDocument::new_invalid_document(key.clone());
    document.convert_to_found_document(SnapshotVersion::min(), data);
    document
}

fn is_array_operator(operator: FilterOperator) -> bool {
    matches!(
        operator,
        FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
    )
}

/// Number of index segments needed to fully serve `target`.
fn target_segment_count(target: &Target) -> usize {
    let mut fields = BTreeSet::new();
    let mut has_array_segment = false;
    for filter in &target.filters {
        if filter.field().is_key_field() {
            continue;
        }
        if is_array_operator(filter.operator()) {
            has_array_segment = true;
        } else {
            fields.insert(filter.field().clone());
        }
    }
    for order_by in &target.order_by {
        if !order_by.field().is_key_field() {
            fields.insert(order_by.field().clone());
        }
    }
    fields.len() + usize::from(has_array_segment)
}

/// Decides whether an index can be used for a target: its `contains` segment must match an
/// array filter, then its directional segments must be equality fields, the inequality field
/// and the order-by clauses, in that order.
struct TargetIndexMatcher<'t> {
    collection_group: String,
    array_filter_fields: BTreeSet<&'t FieldPath>,
    equality_filters: Vec<&'t FieldFilter>,
    equality_fields: BTreeSet<&'t FieldPath>,
    inequality_field: Option<&'t FieldPath>,
    has_multiple_inequality: bool,
    order_by: &'t [OrderBy],
}

impl<'t> TargetIndexMatcher<'t> {
    fn new(target: &'t Target) -> Self {
        let mut array_filter_fields = BTreeSet::new();
        let mut equality_filters = Vec::new();
        let mut equality_fields = BTreeSet::new();
        let mut inequality_field: Option<&FieldPath> = None;
        let mut has_multiple_inequality = false;
        for filter in &target.filters {
            let operator = filter.operator();
            if operator.is_inequality() {
                has_multiple_inequality |= inequality_field.is_some_and(|field| field != filter.field());
                inequality_field.get_or_insert(filter.field());
            } else {
                if is_array_operator(operator) {
                    array_filter_fields.insert(filter.field());
                } else {
                    equality_fields.insert(filter.field());
                }
                equality_filters.push(filter);
            }
        }
        Self {
            collection_group: target.collection_group(),
            array_filter_fields,
            equality_filters,
            equality_fields,
            inequality_field,
            has_multiple_inequality,
            order_by: &target.order_by,
        }
    }

    fn serves(&self, index: &FieldIndex) -> bool {
        if index.collection_group != self.collection_group {
            return false;
        }
        if let Some(segment) = index.array_segment() {
            if !self.array_filter_fields.contains(&segment.field_path) {
                return false;
            }
        }

        let segments = index.directional_segments();
        let mut position = 0;
        let mut consumed = BTreeSet::new();
        while position < segments.len()
            && self.equality_fields.contains(&segments[position].field_path)
        {
            consumed.insert(&segments[position].field_path);
            position += 1;
        }
        if position == segments.len() {
            return true;
        }

        let mut order_by = self.order_by.iter().filter(|order| !consumed.contains(order.field()));
        if let Some(inequality) = self.inequality_field {
            let segment = segments[position];
            if segment.field_path != *inequality {
                return false;
            }
            match order_by.next() {
                Some(order) if matches_order_by(order, segment) => position += 1,
                _ => return false,
            }
        }
        for segment in &segments[position..] {
            match order_by.next() {
                Some(order) if matches_order_by(order, segment) => {}
                _ => return false,
            }
        }
        true
    }
}

impl TargetIndexMatcher<'_> {
    /// An index that fully serves the target: array filters first, then equality fields,
    /// then the order-by clauses (which start with the inequality field). `None` when the
    /// target filters on more than one inequality field.
    fn build_target_index(&self) -> Option<FieldIndex> {
        if self.has_multiple_inequality {
            return None;
        }
        let mut unique_fields = BTreeSet::new();
        let mut segments = Vec::new();
        for filter in &self.equality_filters {
            let field = filter.field();
            if field.is_key_field() {
                continue;
            }
            if is_array_operator(filter.operator()) {
                segments.push(IndexSegment::new(field.clone(), IndexKind::Contains));
            } else if unique_fields.insert(field) {
                segments.push(IndexSegment::new(field.clone(), IndexKind::Ascending));
            }
        }
        for order_by in self.order_by {
            let field = order_by.field();
            if field.is_key_field() || !unique_fields.insert(field) {
                continue;
            }
            let kind = match order_by.direction() {
                Direction::Ascending => IndexKind::Ascending,
                Direction::Descending => IndexKind::Descending,
            };
            segments.push(IndexSegment::new(field.clone(), kind));
        }
        Some(FieldIndex::new(
            FieldIndex::UNKNOWN_ID,
            self.collection_group.clone(),
            segments,
            IndexState::empty(),
        ))
    }
}

fn matches_order_by(order_by: &OrderBy, segment: &IndexSegment) -> bool {
    if order_by.field() != &segment.field_path {
        return false;
    }
    matches!(
        (order_by.direction(), segment.kind),
        (Direction::Ascending, IndexKind::Ascending) | (Direction::Descending, IndexKind::Descending)
    )
}
