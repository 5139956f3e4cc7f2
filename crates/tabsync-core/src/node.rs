//! Network-facing sync node, owned by the sync engine.
//!
//! Only the leader context may keep its node connected.

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{Action, ConnectionState, ErrorReport, Meta};

/// Capacity of a node's event fan-out.
const EVENT_CAPACITY: usize = 256;

/// Event emitted by a sync node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Connection state changed.
    State(ConnectionState),
    /// Server pushed an action.
    Received { action: Action, meta: Meta },
    /// Server or connection reported an error.
    Error(ErrorReport),
}

/// Network connection to the sync server.
pub trait SyncNode: Send + Sync {
    /// Open the connection.
    fn connect(&self);

    /// Close the connection.
    fn disconnect(&self);

    /// Whether the connection is open.
    fn connected(&self) -> bool;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Send an action to the server.
    fn send(&self, action: &Action, meta: &Meta);

    /// Authenticate as another user.
    fn change_user(&self, user: &str);

    /// Receive node events.
    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

struct NodeInner {
    connected: bool,
    state: ConnectionState,
    user: Option<String>,
    sent: Vec<(Action, Meta)>,
    connects: usize,
}

/// Scripted in-memory node.
///
/// Synchronizes immediately on connect unless built with
/// `without_auto_sync`, records every sent action, and lets callers play
/// the server's part with `receive`, `fail` and `set_state`.
pub struct LoopbackNode {
    inner: Mutex<NodeInner>,
    sender: broadcast::Sender<NodeEvent>,
    auto_sync: bool,
}

impl Default for LoopbackNode {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNode {
    /// Create a node that synchronizes on connect.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(NodeInner {
                connected: false,
                state: ConnectionState::Disconnected,
                user: None,
                sent: Vec::new(),
                connects: 0,
            }),
            sender,
            auto_sync: true,
        }
    }

    /// Create a node that stays `connecting` until `set_state` is called.
    #[must_use]
    pub fn without_auto_sync() -> Self {
        Self {
            auto_sync: false,
            ..Self::new()
        }
    }

    /// Move to a new state, emitting an event if it changed.
    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return;
        }
        inner.state = state;
        let _ = self.sender.send(NodeEvent::State(state));
    }

    /// Simulate the server pushing an action.
    pub fn receive(&self, action: Action, meta: Meta) {
        let _ = self.sender.send(NodeEvent::Received { action, meta });
    }

    /// Simulate a server-side error.
    pub fn fail(&self, report: ErrorReport) {
        let _ = self.sender.send(NodeEvent::Error(report));
    }

    /// Actions sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(Action, Meta)> {
        self.inner.lock().sent.clone()
    }

    /// How many times `connect` opened the connection.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.inner.lock().connects
    }

    /// Last user passed to `change_user`.
    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.inner.lock().user.clone()
    }
}

impl SyncNode for LoopbackNode {
    fn connect(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.connected {
                return;
            }
            inner.connected = true;
            inner.connects += 1;
        }
        self.set_state(ConnectionState::Connecting);
        if self.auto_sync {
            self.set_state(ConnectionState::Synchronized);
        }
    }

    fn disconnect(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.connected {
                return;
            }
            inner.connected = false;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    fn send(&self, action: &Action, meta: &Meta) {
        self.inner.lock().sent.push((action.clone(), meta.clone()));
    }

    fn change_user(&self, user: &str) {
        self.inner.lock().user = Some(user.to_owned());
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_synchronizes_once() {
        let node = LoopbackNode::new();
        let mut events = node.subscribe();

        node.connect();
        node.connect();

        assert_eq!(node.connects(), 1);
        assert_eq!(events.try_recv().unwrap(), NodeEvent::State(ConnectionState::Connecting));
        assert_eq!(events.try_recv().unwrap(), NodeEvent::State(ConnectionState::Synchronized));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn disconnect_reports_state() {
        let node = LoopbackNode::without_auto_sync();
        node.connect();
        assert_eq!(node.state(), ConnectionState::Connecting);

        let mut events = node.subscribe();
        node.disconnect();
        assert!(!node.connected());
        assert_eq!(events.try_recv().unwrap(), NodeEvent::State(ConnectionState::Disconnected));
    }

    #[test]
    fn sent_actions_are_recorded() {
        let node = LoopbackNode::new();
        node.send(&Action::new("X"), &Meta::with_id("1 a 0", 1));
        assert_eq!(node.sent().len(), 1);
        assert_eq!(node.sent()[0].0.kind, "X");
    }
}
