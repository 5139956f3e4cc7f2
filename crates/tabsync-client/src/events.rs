//! Public event surface for UI widgets and framework hooks.

use futures::{StreamExt, stream::BoxStream};
use tabsync_core::{Action, ConnectionState, ErrorReport, Meta};
use tabsync_leader::Role;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Capacity of the event fan-out.
const EVENT_CAPACITY: usize = 1024;

/// Event observed by subscribers of one context.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Role changed.
    Role(Role),
    /// Connection state changed, locally or mirrored from the leader.
    State(ConnectionState),
    /// An action was added to the log.
    Add { action: Action, meta: Meta },
    /// An action was removed from the log.
    Clean { action: Action, meta: Meta },
    /// User changed.
    User(String),
    /// Non-fatal error.
    Error(ErrorReport),
}

/// Broadcasts client events to any number of observers.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Deliver an event to current observers.
    pub fn emit(&self, event: ClientEvent) {
        // Events with nobody listening are dropped.
        let _ = self.sender.send(event);
    }

    /// Receiver for events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Stream of events emitted from now on. Lagged events are skipped.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, ClientEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_sees_later_events() {
        let hub = EventHub::new();
        let mut stream = hub.stream();

        hub.emit(ClientEvent::Role(Role::Leader));
        hub.emit(ClientEvent::User("7".into()));

        assert_eq!(stream.next().await, Some(ClientEvent::Role(Role::Leader)));
        assert_eq!(stream.next().await, Some(ClientEvent::User("7".into())));
    }
}
