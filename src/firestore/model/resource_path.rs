use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash separated path of alternating collection and document ids.
///
/// Ordered segment by segment, a path sorting before every path it is a prefix of. Persisted
/// as its canonical string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses `a/b/c`. Leading and trailing slashes are ignored; empty inner segments are not.
    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.split('/').any(str::is_empty) {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(trimmed.split('/')))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_segments(
            self.segments
                .iter()
                .cloned()
                .chain(segments.into_iter().map(Into::into)),
        )
    }

    /// The parent path; the root stays the root.
    pub fn without_last(&self) -> Self {
        let end = self.len().saturating_sub(1);
        Self::from_segments(self.segments[..end].iter().cloned())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Whether `other` is exactly one segment below this path.
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.iter().cmp(other.segments.iter())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical_string())
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResourcePath::from_string(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders() {
        let path = ResourcePath::from_string("/cities/sf/neighborhoods/downtown/").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.to_string(), "cities/sf/neighborhoods/downtown");
        assert_eq!(path.without_last().without_last().to_string(), "cities/sf");
        assert!(ResourcePath::root().without_last().is_empty());
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn prefixes_sort_first() {
        let short = ResourcePath::from_string("a/b").unwrap();
        let long = ResourcePath::from_string("a/b/c").unwrap();
        let other = ResourcePath::from_string("a/c").unwrap();
        assert!(short < long);
        assert!(long < other);
        assert!(short.is_immediate_parent_of(&long));
        assert!(!short.is_immediate_parent_of(&short));
        assert!(!other.is_prefix_of(&long));
    }
}
