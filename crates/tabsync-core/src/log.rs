//! Log model shared with the sync engine, plus an in-memory mirror.

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ContextId;

/// Default number of entries kept by `MemoryLog`.
const DEFAULT_CAPACITY: usize = 10_000;

/// Log action: a `type` plus arbitrary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type, e.g. `logux/subscribe`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Action {
    /// Create an action with no fields.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a string field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Metadata attached to every log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Stable identifier: `"<time> <node> <seq>"`.
    #[serde(default)]
    pub id: String,
    /// Logical time in milliseconds.
    #[serde(default)]
    pub time: u64,
    /// Restricts replay to one context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<ContextId>,
    /// Reasons to keep the entry in the log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// Channels this action belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    /// Action must be sent to the server.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,
    /// Anything else the sync engine stores in meta.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Empty meta; id and time are filled when the action is added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Meta with an explicit id and time.
    #[must_use]
    pub fn with_id(id: impl Into<String>, time: u64) -> Self {
        Self {
            id: id.into(),
            time,
            ..Self::default()
        }
    }

    /// Restrict the entry to one context.
    #[must_use]
    pub fn for_tab(mut self, tab: ContextId) -> Self {
        self.tab = Some(tab);
        self
    }

    /// Add a keep reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Tag the entry with a channel.
    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    /// Mark the entry for the server.
    #[must_use]
    pub fn synced(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Position of this entry as a resubscription cursor.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        Cursor {
            time: self.time,
            id: self.id.clone(),
        }
    }
}

/// Position in the log: newest known entry of a channel.
///
/// Ordered by logical time, then by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Logical time.
    pub time: u64,
    /// Entry id.
    pub id: String,
}

impl Cursor {
    /// Create a cursor.
    #[must_use]
    pub fn new(id: impl Into<String>, time: u64) -> Self {
        Self {
            time,
            id: id.into(),
        }
    }

    /// Strict "first is older" comparison.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        self < other
    }
}

/// One stored log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The action.
    pub action: Action,
    /// Its metadata.
    pub meta: Meta,
}

/// Generates unique ids and monotone times for locally created entries.
#[derive(Debug)]
pub struct MetaIds {
    node: ContextId,
    last_time: u64,
    seq: u64,
}

impl MetaIds {
    /// Create a generator for one context.
    #[must_use]
    pub const fn new(node: ContextId) -> Self {
        Self {
            node,
            last_time: 0,
            seq: 0,
        }
    }

    /// Next `(id, time)` pair. Time never goes backwards.
    pub fn next(&mut self, now: u64) -> (String, u64) {
        if now > self.last_time {
            self.last_time = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        (
            format!("{} {} {}", self.last_time, self.node, self.seq),
            self.last_time,
        )
    }

    /// Fill a missing id and time in place.
    pub fn fill(&mut self, meta: &mut Meta, now: u64) {
        if meta.id.is_empty() {
            let (id, time) = self.next(now);
            meta.id = id;
            if meta.time == 0 {
                meta.time = time;
            }
        } else if meta.time == 0 {
            meta.time = now;
        }
    }
}

/// Client-facing log, owned by the sync engine.
///
/// Only the operations cross-tab coordination needs are modelled here.
pub trait ClientLog: Send + Sync {
    /// Add an entry. Returns `false` when an entry with the same id exists.
    fn add(&self, action: Action, meta: Meta) -> bool;

    /// Remove an entry by id.
    fn clean(&self, id: &str) -> Option<Entry>;

    /// Drop `reason` from every entry; entries left without reasons are removed.
    fn remove_reason(&self, reason: &str) -> Vec<Entry>;

    /// Whether an entry with this id is stored.
    fn contains(&self, id: &str) -> bool;

    /// Snapshot of all entries, oldest first.
    fn entries(&self) -> Vec<Entry>;
}

struct Inner {
    entries: VecDeque<Entry>,
    ids: HashSet<String>,
}

/// In-memory log mirror with id deduplication.
///
/// Oldest entries are evicted once `capacity` is reached; their ids are
/// forgotten too.
pub struct MemoryLog {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Create a log with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a log that keeps at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(32),
                ids: HashSet::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientLog for MemoryLog {
    fn add(&self, action: Action, meta: Meta) -> bool {
        let mut inner = self.inner.write();
        if !inner.ids.insert(meta.id.clone()) {
            return false;
        }
        while inner.entries.len() >= self.capacity {
            if let Some(front) = inner.entries.pop_front() {
                inner.ids.remove(&front.meta.id);
            } else {
                break;
            }
        }
        inner.entries.push_back(Entry { action, meta });
        true
    }

    fn clean(&self, id: &str) -> Option<Entry> {
        let mut inner = self.inner.write();
        let index = inner.entries.iter().position(|e| e.meta.id == id)?;
        inner.ids.remove(id);
        inner.entries.remove(index)
    }

    fn remove_reason(&self, reason: &str) -> Vec<Entry> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.entries.len());

        for mut entry in inner.entries.drain(..) {
            let before = entry.meta.reasons.len();
            entry.meta.reasons.retain(|r| r != reason);
            if before != entry.meta.reasons.len() && entry.meta.reasons.is_empty() {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }

        inner.entries = kept;
        for entry in &removed {
            inner.ids.remove(&entry.meta.id);
        }
        removed
    }

    fn contains(&self, id: &str) -> bool {
        self.inner.read().ids.contains(id)
    }

    fn entries(&self) -> Vec<Entry> {
        self.inner.read().entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let log = MemoryLog::new();
        assert!(log.add(Action::new("X"), Meta::with_id("1 a 0", 1)));
        assert!(!log.add(Action::new("X"), Meta::with_id("1 a 0", 1)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = MemoryLog::with_capacity(2);
        log.add(Action::new("A"), Meta::with_id("1", 1));
        log.add(Action::new("B"), Meta::with_id("2", 2));
        log.add(Action::new("C"), Meta::with_id("3", 3));

        let kinds: Vec<_> = log.entries().into_iter().map(|e| e.action.kind).collect();
        assert_eq!(kinds, ["B", "C"]);
        assert!(!log.contains("1"));
    }

    #[test]
    fn remove_reason_cleans_only_orphans() {
        let log = MemoryLog::new();
        log.add(Action::new("A"), Meta::with_id("1", 1).reason("sync"));
        log.add(
            Action::new("B"),
            Meta::with_id("2", 2).reason("sync").reason("ui"),
        );
        log.add(Action::new("C"), Meta::with_id("3", 3));

        let removed = log.remove_reason("sync");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].action.kind, "A");
        assert!(log.contains("2"));
        assert!(log.contains("3"));
        assert_eq!(log.entries()[0].meta.reasons, ["ui"]);
    }

    #[test]
    fn clean_removes_by_id() {
        let log = MemoryLog::new();
        log.add(Action::new("A"), Meta::with_id("1", 1));
        assert_eq!(log.clean("1").map(|e| e.action.kind), Some("A".into()));
        assert!(log.clean("1").is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn meta_ids_stay_unique_within_one_millisecond() {
        let mut ids = MetaIds::new(ContextId::from("t1"));
        assert_eq!(ids.next(10), ("10 t1 0".to_string(), 10));
        assert_eq!(ids.next(10), ("10 t1 1".to_string(), 10));
        assert_eq!(ids.next(9), ("10 t1 2".to_string(), 10));
        assert_eq!(ids.next(11), ("11 t1 0".to_string(), 11));
    }

    #[test]
    fn fill_keeps_explicit_values() {
        let mut ids = MetaIds::new(ContextId::from("t1"));
        let mut meta = Meta::with_id("server 1", 0);
        ids.fill(&mut meta, 42);
        assert_eq!(meta.id, "server 1");
        assert_eq!(meta.time, 42);
    }

    #[test]
    fn cursor_orders_by_time_then_id() {
        let a = Cursor::new("5 b 0", 5);
        let b = Cursor::new("5 c 0", 5);
        let c = Cursor::new("1 z 0", 6);
        assert!(a.is_older_than(&b));
        assert!(b.is_older_than(&c));
        assert!(!a.is_older_than(&a));
    }

    #[test]
    fn action_flattens_fields() {
        let action = Action::new("logux/subscribe").with("channel", "users/1");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value, json!({"type": "logux/subscribe", "channel": "users/1"}));
    }

    #[test]
    fn meta_omits_empty_fields() {
        let value = serde_json::to_value(Meta::with_id("1 t 0", 1)).unwrap();
        assert_eq!(value, json!({"id": "1 t 0", "time": 1}));
    }
}
