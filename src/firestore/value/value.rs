use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    /// Stable textual form used to build canonical ids of queries and targets.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => format!("geo({},{})", value.latitude(), value.longitude()),
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(|v| v.canonical_id()).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Rank of the value's type in the cross-type sort order.
    pub fn type_order(&self) -> u8 {
        match &self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::String(_) => 4,
            ValueKind::Bytes(_) => 5,
            ValueKind::Reference(_) => 6,
            ValueKind::GeoPoint(_) => 7,
            ValueKind::Array(_) => 8,
            ValueKind::Map(_) => 9,
        }
    }
}

/// Total order over values: first by type, then within the type.
///
/// Integers and doubles share one numeric ordering; NaN sorts before every other number and
/// equals itself.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let type_ordering = left.type_order().cmp(&right.type_order());
    if type_ordering != Ordering::Equal {
        return type_ordering;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_reference_paths(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.index_cmp(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                match lk.cmp(rk) {
                    Ordering::Equal => {}
                    ordering => return ordering,
                }
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// Semantic equality: `1 == 1.0`, and NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    compare_values(left, right) == Ordering::Equal
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_reference_paths(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                ordering => return ordering,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}
