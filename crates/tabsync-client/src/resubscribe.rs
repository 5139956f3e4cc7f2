//! Tracks channel subscriptions and replays them after a reconnect.
//!
//! Every subscription remembers the newest entry seen for its channel, so a
//! resubscribe asks the server only for what came after it.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};
use tabsync_core::{Action, ConnectionState, Cursor, Meta};

const SUBSCRIBE: &str = "logux/subscribe";
const UNSUBSCRIBE: &str = "logux/unsubscribe";
const PROCESSED: &str = "logux/processed";
const UNDO: &str = "logux/undo";

/// One active channel subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Channel name.
    pub channel: String,
    /// Extra subscribe fields, part of the subscription's identity.
    pub filter: Map<String, Value>,
    /// Newest known entry of the channel.
    pub last_known_cursor: Option<Cursor>,
}

impl Subscription {
    /// Create a subscription without a cursor.
    #[must_use]
    pub fn new(channel: impl Into<String>, filter: Map<String, Value>) -> Self {
        Self {
            channel: channel.into(),
            filter,
            last_known_cursor: None,
        }
    }

    fn from_action(action: &Action) -> Option<Self> {
        let channel = action.get_str("channel")?;
        let filter = action
            .fields
            .iter()
            .filter(|(key, _)| key.as_str() != "channel" && key.as_str() != "since")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Some(Self::new(channel, filter))
    }

    fn key(&self) -> String {
        format!("{} {}", self.channel, Value::Object(self.filter.clone()))
    }

    /// Subscribe action for this subscription, with `since` when a cursor is known.
    #[must_use]
    pub fn to_action(&self) -> Action {
        let mut action = Action::new(SUBSCRIBE).with("channel", self.channel.clone());
        action.fields.extend(self.filter.clone());
        if let Some(cursor) = &self.last_known_cursor {
            action = action.with("since", json!({ "id": cursor.id, "time": cursor.time }));
        }
        action
    }

    /// Unsubscribe action matching this subscription.
    #[must_use]
    pub fn to_unsubscribe(&self) -> Action {
        let mut action = Action::new(UNSUBSCRIBE).with("channel", self.channel.clone());
        action.fields.extend(self.filter.clone());
        action
    }
}

/// Subscription table with per-channel cursors.
#[derive(Debug)]
pub struct ResubscriptionManager {
    subscriptions: BTreeMap<String, Subscription>,
    /// Subscribe meta id -> subscription key, until the server answers.
    pending: HashMap<String, String>,
    cursors: HashMap<String, Cursor>,
    disconnected: bool,
}

impl Default for ResubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResubscriptionManager {
    /// Empty table. The initial state counts as disconnected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            pending: HashMap::new(),
            cursors: HashMap::new(),
            disconnected: true,
        }
    }

    /// Feed an entry that reached the log.
    pub fn observe(&mut self, action: &Action, meta: &Meta) {
        match action.kind.as_str() {
            SUBSCRIBE => {
                if let Some(subscription) = Subscription::from_action(action) {
                    let key = subscription.key();
                    self.pending.insert(meta.id.clone(), key.clone());
                    self.subscriptions.entry(key).or_insert(subscription);
                }
            }
            UNSUBSCRIBE => {
                if let Some(subscription) = Subscription::from_action(action) {
                    self.subscriptions.remove(&subscription.key());
                }
            }
            PROCESSED => {
                let key = action.get_str("id").and_then(|id| self.pending.remove(id));
                if let Some(channel) = key
                    .and_then(|key| self.subscriptions.get(&key))
                    .map(|s| s.channel.clone())
                {
                    self.advance(&channel, meta.cursor());
                }
            }
            UNDO => {
                let key = action.get_str("id").and_then(|id| self.pending.remove(id));
                if let Some(key) = key {
                    tracing::debug!(subscription = %key, "Subscription refused");
                    self.subscriptions.remove(&key);
                }
            }
            _ => {}
        }

        for channel in &meta.channels {
            self.advance(channel, meta.cursor());
        }
    }

    /// Remember a resubscribe request sent outside the log, so the server's
    /// answer to it still moves the channel's cursor.
    pub fn track(&mut self, request: &Action, meta: &Meta) {
        if let Some(subscription) = Subscription::from_action(request) {
            let key = subscription.key();
            if self.subscriptions.contains_key(&key) {
                self.pending.insert(meta.id.clone(), key);
            }
        }
    }

    /// Move a channel's cursor forward. Older cursors are ignored.
    ///
    /// Returns whether the cursor moved.
    pub fn advance(&mut self, channel: &str, cursor: Cursor) -> bool {
        match self.cursors.get_mut(channel) {
            Some(current) if !current.is_older_than(&cursor) => false,
            Some(current) => {
                *current = cursor;
                true
            }
            None => {
                self.cursors.insert(channel.to_owned(), cursor);
                true
            }
        }
    }

    /// Newest known entry of a channel.
    #[must_use]
    pub fn cursor(&self, channel: &str) -> Option<&Cursor> {
        self.cursors.get(channel)
    }

    /// Feed a connection state of the node.
    ///
    /// Returns the subscribe actions to send when the connection came back.
    pub fn on_state(&mut self, state: ConnectionState) -> Vec<Action> {
        match state {
            ConnectionState::Disconnected => {
                self.disconnected = true;
                Vec::new()
            }
            ConnectionState::Sending | ConnectionState::Synchronized if self.disconnected => {
                self.disconnected = false;
                let requests: Vec<_> = self.subscriptions().iter().map(Subscription::to_action).collect();
                if !requests.is_empty() {
                    tracing::info!(count = requests.len(), "Resubscribing");
                }
                requests
            }
            _ => Vec::new(),
        }
    }

    /// Snapshot of active subscriptions with their cursors.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .values()
            .map(|s| Subscription {
                last_known_cursor: self.cursors.get(&s.channel).cloned(),
                ..s.clone()
            })
            .collect()
    }
}
