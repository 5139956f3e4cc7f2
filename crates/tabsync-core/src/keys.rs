//! Key namespacing for the shared channel.
//!
//! Every key is `<prefix>:<user>:<suffix>`, so two users of the same
//! application never see each other's leader or log traffic.

use std::fmt;

/// Kind of record stored under one key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `[holderId, timestamp]` or `[]`.
    Leader,
    /// Leader's connection state.
    State,
    /// Log addition.
    Add,
    /// Log removal.
    Clean,
    /// User switch.
    User,
    /// Announced subprotocol version.
    Subprotocol,
}

impl Topic {
    /// All topics, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::Leader,
        Self::State,
        Self::Add,
        Self::Clean,
        Self::User,
        Self::Subprotocol,
    ];

    /// Key suffix of this topic.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::State => "state",
            Self::Add => "add",
            Self::Clean => "clean",
            Self::User => "user",
            Self::Subprotocol => "subprotocol",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.suffix() == suffix)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Namespace of one client: application prefix plus current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    user: String,
}

impl KeySpace {
    /// Create a key space.
    #[must_use]
    pub fn new(prefix: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            user: user.into(),
        }
    }

    /// Current user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Same prefix, different user.
    #[must_use]
    pub fn with_user(&self, user: impl Into<String>) -> Self {
        Self::new(self.prefix.clone(), user)
    }

    /// Full key of a topic.
    #[must_use]
    pub fn key(&self, topic: Topic) -> String {
        format!("{}:{}:{}", self.prefix, self.user, topic.suffix())
    }

    /// Map a key back to its topic, if it belongs to this namespace.
    #[must_use]
    pub fn topic_of(&self, key: &str) -> Option<Topic> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        let suffix = rest.strip_prefix(self.user.as_str())?.strip_prefix(':')?;
        Topic::from_suffix(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = KeySpace::new("app", "10");
        assert_eq!(keys.key(Topic::Leader), "app:10:leader");
        assert_eq!(keys.key(Topic::Subprotocol), "app:10:subprotocol");
    }

    #[test]
    fn topic_lookup_ignores_foreign_keys() {
        let keys = KeySpace::new("app", "10");
        assert_eq!(keys.topic_of("app:10:add"), Some(Topic::Add));
        assert_eq!(keys.topic_of("app:11:add"), None);
        assert_eq!(keys.topic_of("other:10:add"), None);
        assert_eq!(keys.topic_of("app:10:unknown"), None);
        assert_eq!(keys.topic_of("app:100:add"), None);
    }

    #[test]
    fn switching_user_moves_every_key() {
        let keys = KeySpace::new("app", "10").with_user("20");
        assert_eq!(keys.user(), "20");
        assert_eq!(keys.key(Topic::State), "app:20:state");
    }
}
