//! Shared notify-on-write channel between contexts.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{ContextId, KeySpace, LeaderRecord, ProtocolError, Topic};

/// Capacity of the notification fan-out.
const NOTIFY_CAPACITY: usize = 1024;

/// Shared channel error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Shared channel unavailable")]
    Unavailable,
    #[error("Shared channel quota exceeded writing {0}")]
    QuotaExceeded(String),
    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Whether the storage itself refused the operation.
    #[must_use]
    pub const fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Unavailable | Self::QuotaExceeded(_))
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        Self::Encode(err.to_string())
    }
}

/// Change notification delivered to every observer except the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    /// Key that changed.
    pub key: String,
    /// New value.
    pub value: String,
    /// Context that wrote it.
    pub writer: ContextId,
}

/// Publish/subscribe bus with last-value storage per key.
///
/// Writes to one key are last-write-wins. A write notifies every other
/// subscriber; the writer itself is never notified.
pub trait SharedChannel: Send + Sync + 'static {
    /// Store `value` under `key` and notify other observers.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable or refuses the write.
    fn publish(&self, writer: &ContextId, key: &str, value: &str) -> Result<(), ChannelError>;

    /// Read the last value stored under `key`.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable.
    fn read(&self, key: &str) -> Result<Option<String>, ChannelError>;

    /// Receive notifications for writes made by other contexts.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable.
    fn subscribe(&self, observer: &ContextId) -> Result<ChannelSubscription, ChannelError>;
}

/// Notifications seen by one observer.
///
/// Dropping the subscription unsubscribes.
pub struct ChannelSubscription {
    observer: ContextId,
    receiver: broadcast::Receiver<ChannelEvent>,
}

impl ChannelSubscription {
    /// Wrap a raw receiver, hiding the observer's own writes.
    #[must_use]
    pub const fn new(observer: ContextId, receiver: broadcast::Receiver<ChannelEvent>) -> Self {
        Self { observer, receiver }
    }

    /// Wait for the next foreign write. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.writer == self.observer => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(tab = %self.observer, skipped, "Shared channel notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next foreign write if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.writer == self.observer => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }

    /// Stream of foreign writes.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, ChannelEvent> {
        let observer = self.observer;
        BroadcastStream::new(self.receiver)
            .filter_map(move |res: Result<ChannelEvent, BroadcastStreamRecvError>| {
                let event = res.ok().filter(|e| e.writer != observer);
                async move { event }
            })
            .boxed()
    }
}

/// In-memory shared channel with browser-storage semantics.
///
/// Writing the value a key already holds notifies nobody.
pub struct MemoryChannel {
    values: RwLock<HashMap<String, String>>,
    sender: broadcast::Sender<ChannelEvent>,
    enabled: bool,
    writable: AtomicBool,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    /// Create an empty, working channel.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            sender,
            enabled: true,
            writable: AtomicBool::new(true),
        }
    }

    /// Channel whose every operation fails, like disabled storage.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Allow or refuse further writes. Refused writes fail with `QuotaExceeded`.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Snapshot of every stored key.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.read().clone()
    }
}

impl SharedChannel for MemoryChannel {
    fn publish(&self, writer: &ContextId, key: &str, value: &str) -> Result<(), ChannelError> {
        if !self.enabled {
            return Err(ChannelError::Unavailable);
        }
        if !self.writable.load(Ordering::SeqCst) {
            return Err(ChannelError::QuotaExceeded(key.to_owned()));
        }

        let mut values = self.values.write();
        if values.get(key).is_some_and(|current| current == value) {
            return Ok(());
        }
        values.insert(key.to_owned(), value.to_owned());

        // No receivers is fine: nobody else is listening yet.
        let _ = self.sender.send(ChannelEvent {
            key: key.to_owned(),
            value: value.to_owned(),
            writer: writer.clone(),
        });
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>, ChannelError> {
        if !self.enabled {
            return Err(ChannelError::Unavailable);
        }
        Ok(self.values.read().get(key).cloned())
    }

    fn subscribe(&self, observer: &ContextId) -> Result<ChannelSubscription, ChannelError> {
        if !self.enabled {
            return Err(ChannelError::Unavailable);
        }
        Ok(ChannelSubscription::new(observer.clone(), self.sender.subscribe()))
    }
}

/// One context's view of the shared channel.
///
/// Resolves topics to keys in the current namespace and remembers when the
/// underlying storage has failed, after which every call fails fast.
pub struct TabChannel {
    id: ContextId,
    bus: Arc<dyn SharedChannel>,
    keys: RwLock<KeySpace>,
    failed: AtomicBool,
}

impl TabChannel {
    /// Create a view for context `id`.
    #[must_use]
    pub fn new(id: ContextId, bus: Arc<dyn SharedChannel>, keys: KeySpace) -> Self {
        Self {
            id,
            bus,
            keys: RwLock::new(keys),
            failed: AtomicBool::new(false),
        }
    }

    /// This context.
    #[must_use]
    pub const fn id(&self) -> &ContextId {
        &self.id
    }

    /// Current namespace.
    #[must_use]
    pub fn keys(&self) -> KeySpace {
        self.keys.read().clone()
    }

    /// Move to another user's namespace.
    pub fn set_user(&self, user: &str) {
        let mut keys = self.keys.write();
        *keys = keys.with_user(user);
    }

    /// Whether the storage still works for this context.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    /// Stop using the storage.
    pub fn disable(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Topic of a key in the current namespace.
    #[must_use]
    pub fn topic_of(&self, key: &str) -> Option<Topic> {
        self.keys.read().topic_of(key)
    }

    /// Write a topic's value.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable or refuses the write.
    pub fn publish(&self, topic: Topic, value: &str) -> Result<(), ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Unavailable);
        }
        let key = self.keys.read().key(topic);
        self.bus
            .publish(&self.id, &key, value)
            .inspect_err(|_| self.disable())
    }

    /// Read a topic's last value.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable.
    pub fn read(&self, topic: Topic) -> Result<Option<String>, ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Unavailable);
        }
        let key = self.keys.read().key(topic);
        self.bus.read(&key).inspect_err(|_| self.disable())
    }

    /// Read and decode the current leader record.
    ///
    /// An undecodable value counts as no leader.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable.
    pub fn read_leader(&self) -> Result<Option<LeaderRecord>, ChannelError> {
        let Some(raw) = self.read(Topic::Leader)? else {
            return Ok(None);
        };
        Ok(LeaderRecord::decode(&raw).unwrap_or_else(|e| {
            tracing::warn!(tab = %self.id, "Ignoring leader record: {e}");
            None
        }))
    }

    /// Subscribe to other contexts' writes.
    ///
    /// # Errors
    /// Returns error if the storage is unavailable.
    pub fn subscribe(&self) -> Result<ChannelSubscription, ChannelError> {
        self.bus.subscribe(&self.id).inspect_err(|_| self.disable())
    }
}
