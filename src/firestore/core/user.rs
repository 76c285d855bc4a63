use std::fmt::{Display, Formatter};

/// Identity of the principal whose writes are queued locally.
///
/// Only used as a namespace: mutation queues, overlays and index state are stored per user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which this user's data is persisted.
    pub fn storage_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(anonymous)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_are_distinct() {
        assert_eq!(User::unauthenticated().storage_key(), "");
        assert_eq!(User::authenticated("alice").storage_key(), "alice");
        assert_ne!(User::unauthenticated(), User::authenticated("alice"));
    }
}
