use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::Target;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }

        let other = document.field(&self.field);
        match self.operator {
            FilterOperator::ArrayContains => match other.map(FirestoreValue::kind) {
                Some(ValueKind::Array(array)) => array.contains(&self.value),
                _ => false,
            },
            FilterOperator::ArrayContainsAny => {
                match (other.map(FirestoreValue::kind), self.value.kind()) {
                    (Some(ValueKind::Array(array)), ValueKind::Array(needles)) => {
                        needles.values().iter().any(|needle| array.contains(needle))
                    }
                    _ => false,
                }
            }
            FilterOperator::In => match (other, self.value.kind()) {
                (Some(other), ValueKind::Array(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let ValueKind::Array(candidates) = self.value.kind() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) if !matches!(other.kind(), ValueKind::Null) => {
                        !candidates.contains(other)
                    }
                    _ => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) if !matches!(other.kind(), ValueKind::Null) => {
                    self.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
            _ => match other {
                Some(other) if other.type_order() == self.value.type_order() => {
                    self.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        let reference_key = |value: &FirestoreValue| match value.kind() {
            ValueKind::Reference(path) => DocumentKey::from_string(path).ok(),
            _ => None,
        };
        match self.operator {
            FilterOperator::In | FilterOperator::NotIn => {
                let ValueKind::Array(candidates) = self.value.kind() else {
                    return false;
                };
                let found = candidates
                    .values()
                    .iter()
                    .filter_map(reference_key)
                    .any(|candidate| &candidate == key);
                (self.operator == FilterOperator::In) == found
            }
            _ => match reference_key(&self.value) {
                Some(reference) => self.matches_comparison(key.cmp(&reference)),
                None => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            self.value.canonical_id()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn flipped(&self) -> Self {
        let direction = match self.direction {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        };
        Self::new(self.field.clone(), direction)
    }

    pub(crate) fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Cursor position given as values for the leading order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field().is_key_field() {
                match component.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(document.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                match document.field(order.field()) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction() {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True when the bound, used as a start cursor, admits `document`.
    pub(crate) fn sorts_before_document(
        &self,
        order_by: &[OrderBy],
        document: &MutableDocument,
    ) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// True when the bound, used as an end cursor, admits `document`.
    pub(crate) fn sorts_after_document(
        &self,
        order_by: &[OrderBy],
        document: &MutableDocument,
    ) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(|v| v.canonical_id()).collect();
        format!(
            "{}{}",
            if self.inclusive { "b:" } else { "a:" },
            values.join(",")
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    First,
    Last,
}

/// A query over a collection, a collection group or a single document.
///
/// Evaluation mirrors the backend: a document matches when it is found, lives at the
/// queried path, has every order-by field, passes every filter and sits between the
/// cursors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for the documents at `path`: a collection, or a single document.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group_query(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit(mut self, limit: Option<u32>, limit_type: LimitType) -> Self {
        self.limit = limit;
        self.limit_type = limit_type;
        self
    }

    pub fn with_limit_to_first(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::First)
    }

    pub fn with_limit_to_last(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::Last)
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Same query, rooted at `path` instead of matching a collection group.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::from_path(self.path.clone()).is_ok()
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection group whose documents the query reads.
    pub fn collection_group(&self) -> String {
        match &self.collection_group {
            Some(group) => group.clone(),
            None if self.path.len() % 2 == 0 => {
                let parent = self.path.without_last();
                parent.last_segment().unwrap_or_default().to_string()
            }
            None => self.path.last_segment().unwrap_or_default().to_string(),
        }
    }

    /// True when the query returns every document in its collection unchanged.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|filter| filter.operator().is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order-by clauses followed by the implicit ones: inequality fields in
    /// lexicographic order and finally the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut normalized = self.explicit_order_by.clone();
        let last_direction = normalized
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        let present: BTreeSet<FieldPath> = normalized
            .iter()
            .map(|order| order.field().clone())
            .collect();
        for field in self.inequality_fields() {
            if !present.contains(&field) && !field.is_key_field() {
                normalized.push(OrderBy::new(field, last_direction));
            }
        }

        if !normalized.iter().any(|order| order.field().is_key_field()) {
            normalized.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        normalized
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let document_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if DocumentKey::from_path(self.path.clone()).is_ok() {
            &self.path == document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by().iter().all(|order| {
            order.field().is_key_field() || document.field(order.field()).is_some()
        })
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Comparator giving the query's result order.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let mut saw_key = false;
        for order in self.normalized_order_by() {
            saw_key |= order.field().is_key_field();
            match order.compare(left, right) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        if saw_key {
            Ordering::Equal
        } else {
            left.key().cmp(right.key())
        }
    }

    /// Sorts, bounds and limits `documents` the way a listener would see them.
    pub fn apply_to_documents(&self, mut documents: Vec<MutableDocument>) -> Vec<MutableDocument> {
        documents.retain(|document| self.matches(document));
        documents.sort_by(|left, right| self.compare_documents(left, right));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if documents.len() > limit {
                match self.limit_type {
                    LimitType::First => documents.truncate(limit),
                    LimitType::Last => {
                        let start = documents.len() - limit;
                        documents.drain(0..start);
                    }
                }
            }
        }
        documents
    }

    /// The backend target for this query. Limit-to-last queries run with flipped ordering
    /// and swapped cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Equality filter value helper used by the index matcher.
    pub(crate) fn equality_value(&self, field: &FieldPath) -> Option<&FirestoreValue> {
        self.filters
            .iter()
            .find(|filter| filter.operator() == FilterOperator::Equal && filter.field() == field)
            .map(FieldFilter::value)
    }
}

impl From<ResourcePath> for Query {
    fn from(path: ResourcePath) -> Self {
        Query::new(path)
    }
}
