//! Wire format of the values stored under each channel key.
//!
//! | Key suffix | Payload |
//! |---|---|
//! | `leader` | `[holderId, timestampMillis]` or `[]` |
//! | `state` | `"disconnected"`, `"connecting"`, `"sending"`, `"synchronized"` |
//! | `add` / `clean` | `[originId, action, meta]` |
//! | `user` | `[originId, newUserId]` |
//! | `subprotocol` | `"1.0.0"` |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Action, ContextId, Meta, Topic};

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed {topic} payload: {reason}")]
    Malformed { topic: Topic, reason: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Connection state of the leader's network node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Connection is being established.
    Connecting,
    /// Connected, pending actions are being sent.
    Sending,
    /// Connected and up to date.
    Synchronized,
}

impl ConnectionState {
    /// Whether the node is talking to the server.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Sending | Self::Synchronized)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Sending => "sending",
            Self::Synchronized => "synchronized",
        })
    }
}

/// Claim of leadership, refreshed by the leader's heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecord {
    /// Context holding (or contending for) leadership.
    pub holder: ContextId,
    /// Last heartbeat, in milliseconds.
    pub timestamp: u64,
}

impl LeaderRecord {
    /// Create a record.
    #[must_use]
    pub const fn new(holder: ContextId, timestamp: u64) -> Self {
        Self { holder, timestamp }
    }

    /// Encode a record, or `[]` for resignation.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(record: Option<&Self>) -> Result<String, ProtocolError> {
        match record {
            Some(r) => Ok(serde_json::to_string(&(&r.holder, r.timestamp))?),
            None => Ok("[]".to_owned()),
        }
    }

    /// Decode a stored value. `[]` decodes to `None`.
    ///
    /// # Errors
    /// Returns error if the value is not a valid leader payload.
    pub fn decode(raw: &str) -> Result<Option<Self>, ProtocolError> {
        let parts: Vec<Value> = serde_json::from_str(raw)?;
        match parts.as_slice() {
            [] => Ok(None),
            [holder, timestamp] => {
                let holder = holder.as_str().ok_or_else(|| malformed(Topic::Leader, "holder is not a string"))?;
                let timestamp = timestamp
                    .as_u64()
                    .or_else(|| timestamp.as_f64().filter(|t| *t >= 0.0).map(|t| t as u64))
                    .ok_or_else(|| malformed(Topic::Leader, "timestamp is not a number"))?;
                Ok(Some(Self::new(ContextId::from(holder), timestamp)))
            }
            _ => Err(malformed(Topic::Leader, "expected 0 or 2 elements")),
        }
    }
}

/// Kind of log mutation relayed between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Action added.
    Add,
    /// Action removed.
    Clean,
}

impl MutationKind {
    /// Topic the mutation travels on.
    #[must_use]
    pub const fn topic(self) -> Topic {
        match self {
            Self::Add => Topic::Add,
            Self::Clean => Topic::Clean,
        }
    }
}

/// Log change made by one context and mirrored by the others.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMutation {
    /// Add or clean.
    pub kind: MutationKind,
    /// Context that made the change.
    pub origin: ContextId,
    /// The action.
    pub action: Action,
    /// Its metadata.
    pub meta: Meta,
}

impl LogMutation {
    /// Encode as `[originId, action, meta]`.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&(&self.origin, &self.action, &self.meta))?)
    }

    /// Decode `[originId, action, meta]`.
    ///
    /// # Errors
    /// Returns error if the value is not a valid mutation payload.
    pub fn decode(kind: MutationKind, raw: &str) -> Result<Self, ProtocolError> {
        let (origin, action, meta): (ContextId, Action, Meta) = serde_json::from_str(raw)?;
        Ok(Self {
            kind,
            origin,
            action,
            meta,
        })
    }
}

/// Encode `[originId, newUserId]`.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_user(origin: &ContextId, user: &str) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&(origin, user))?)
}

/// Encode the connection state.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_state(state: ConnectionState) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&state)?)
}

/// Encode an announced subprotocol version.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_subprotocol(version: &str) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(version)?)
}

/// Decoded value received from another context.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Leader heartbeat, or `None` for resignation.
    Leader(Option<LeaderRecord>),
    /// Leader's connection state.
    State(ConnectionState),
    /// Log mutation.
    Mutation(LogMutation),
    /// User switch.
    User { origin: ContextId, user: String },
    /// Peer's subprotocol version.
    Subprotocol(String),
}

impl Incoming {
    /// Decode the value stored under a topic.
    ///
    /// # Errors
    /// Returns error if the value does not match the topic's format.
    pub fn decode(topic: Topic, raw: &str) -> Result<Self, ProtocolError> {
        Ok(match topic {
            Topic::Leader => Self::Leader(LeaderRecord::decode(raw)?),
            Topic::State => Self::State(serde_json::from_str(raw)?),
            Topic::Add => Self::Mutation(LogMutation::decode(MutationKind::Add, raw)?),
            Topic::Clean => Self::Mutation(LogMutation::decode(MutationKind::Clean, raw)?),
            Topic::User => {
                let (origin, user): (ContextId, String) = serde_json::from_str(raw)?;
                Self::User { origin, user }
            }
            Topic::Subprotocol => Self::Subprotocol(serde_json::from_str(raw)?),
        })
    }
}

fn malformed(topic: Topic, reason: &str) -> ProtocolError {
    ProtocolError::Malformed {
        topic,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_record_wire_format() {
        let record = LeaderRecord::new(ContextId::from("tab1"), 1_700);
        let raw = LeaderRecord::encode(Some(&record)).unwrap();
        assert_eq!(raw, r#"["tab1",1700]"#);
        assert_eq!(LeaderRecord::decode(&raw).unwrap(), Some(record));
    }

    #[test]
    fn empty_leader_record_means_resignation() {
        assert_eq!(LeaderRecord::encode(None).unwrap(), "[]");
        assert_eq!(LeaderRecord::decode("[]").unwrap(), None);
    }

    #[test]
    fn leader_record_accepts_float_timestamps() {
        let record = LeaderRecord::decode(r#"["tab1",1700.0]"#).unwrap().unwrap();
        assert_eq!(record.timestamp, 1_700);
    }

    #[test]
    fn malformed_leader_record_is_rejected() {
        assert!(LeaderRecord::decode(r#"["tab1"]"#).is_err());
        assert!(LeaderRecord::decode(r#"[1, 2]"#).is_err());
        assert!(LeaderRecord::decode("{}").is_err());
    }

    #[test]
    fn state_uses_lowercase_names() {
        assert_eq!(encode_state(ConnectionState::Synchronized).unwrap(), r#""synchronized""#);
        let incoming = Incoming::decode(Topic::State, r#""sending""#).unwrap();
        assert_eq!(incoming, Incoming::State(ConnectionState::Sending));
    }

    #[test]
    fn mutation_is_a_three_element_array() {
        let mutation = LogMutation {
            kind: MutationKind::Add,
            origin: ContextId::from("tab1"),
            action: Action::new("X"),
            meta: Meta::with_id("1 tab1 0", 1),
        };
        let raw = mutation.encode().unwrap();
        assert_eq!(raw, r#"["tab1",{"type":"X"},{"id":"1 tab1 0","time":1}]"#);

        match Incoming::decode(Topic::Add, &raw).unwrap() {
            Incoming::Mutation(decoded) => assert_eq!(decoded, mutation),
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn user_and_subprotocol_payloads() {
        let raw = encode_user(&ContextId::from("tab1"), "42").unwrap();
        assert_eq!(raw, r#"["tab1","42"]"#);
        assert_eq!(
            Incoming::decode(Topic::User, &raw).unwrap(),
            Incoming::User {
                origin: ContextId::from("tab1"),
                user: "42".into()
            }
        );

        let raw = encode_subprotocol("1.2.0").unwrap();
        assert_eq!(
            Incoming::decode(Topic::Subprotocol, &raw).unwrap(),
            Incoming::Subprotocol("1.2.0".into())
        );
    }
}
