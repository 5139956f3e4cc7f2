//! Public handle of one context.

use std::sync::Arc;

use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tabsync_core::{
    Action, ClientLog, Clock, ConnectionState, ContextId, Entry, MemoryLog, Meta, SharedChannel, SyncNode,
    SystemClock,
};
use tabsync_leader::{Leadership, Role};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    ClientConfig, ClientError, ClientEvent, EventHub, Subscription,
    runtime::{Command, Runtime, Wiring},
};

/// Builder for `CrossTabClient`.
pub struct ClientBuilder {
    config: ClientConfig,
    bus: Arc<dyn SharedChannel>,
    node: Arc<dyn SyncNode>,
    clock: Option<Arc<dyn Clock>>,
    log: Option<Arc<dyn ClientLog>>,
    leadership: Leadership,
    id: Option<ContextId>,
}

impl ClientBuilder {
    /// Start from a config, the shared bus and this context's sync node.
    #[must_use]
    pub fn new(config: ClientConfig, bus: Arc<dyn SharedChannel>, node: Arc<dyn SyncNode>) -> Self {
        Self {
            config,
            bus,
            node,
            clock: None,
            log: None,
            leadership: Leadership::Heartbeat,
            id: None,
        }
    }

    /// Clock for leader timestamps and action times. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Log to mirror into. Defaults to a fresh `MemoryLog`.
    #[must_use]
    pub fn log(mut self, log: Arc<dyn ClientLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// How leadership is obtained. Defaults to the heartbeat race.
    #[must_use]
    pub fn leadership(mut self, leadership: Leadership) -> Self {
        self.leadership = leadership;
        self
    }

    /// Fixed context id. Defaults to a random one.
    #[must_use]
    pub fn id(mut self, id: ContextId) -> Self {
        self.id = Some(id);
        self
    }

    /// Validate the config and spawn the context's runtime.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn start(self) -> Result<CrossTabClient, ClientError> {
        self.config.validate()?;

        let id = self.id.unwrap_or_else(ContextId::generate);
        let log = self.log.unwrap_or_else(|| Arc::new(MemoryLog::new()));
        let events = EventHub::new();

        let (runtime, handles) = Runtime::new(Wiring {
            id: id.clone(),
            config: self.config,
            bus: self.bus,
            node: self.node,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            log: Arc::clone(&log),
            leadership: self.leadership,
            events: events.clone(),
        });
        tokio::spawn(runtime.run());

        Ok(CrossTabClient {
            id,
            commands: handles.commands,
            role: handles.role,
            state: handles.state,
            events,
            log,
        })
    }
}

/// One context taking part in cross-tab coordination.
///
/// Dropping the handle tears the context down as `destroy` does, without
/// waiting for it.
pub struct CrossTabClient {
    id: ContextId,
    commands: mpsc::UnboundedSender<Command>,
    role: watch::Receiver<Role>,
    state: watch::Receiver<ConnectionState>,
    events: EventHub,
    log: Arc<dyn ClientLog>,
}

impl CrossTabClient {
    /// Builder with default collaborators.
    #[must_use]
    pub fn builder(config: ClientConfig, bus: Arc<dyn SharedChannel>, node: Arc<dyn SyncNode>) -> ClientBuilder {
        ClientBuilder::new(config, bus, node)
    }

    /// This context's id.
    #[must_use]
    pub const fn id(&self) -> &ContextId {
        &self.id
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Connection state: own when leader, mirrored otherwise.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for events emitted from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Stream of events emitted from now on.
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, ClientEvent> {
        self.events.stream()
    }

    /// The local log mirror.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn ClientLog> {
        &self.log
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)
    }

    /// Add an action to the log and share it with the other contexts.
    ///
    /// Missing `id` and `time` are filled in. Returns the stored meta, or
    /// `None` if an entry with the same id already exists.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn add(&self, action: Action, meta: Meta) -> Result<Option<Meta>, ClientError> {
        self.request(|reply| Command::Add { action, meta, reply }).await
    }

    /// Remove an entry by id.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn clean(&self, id: impl Into<String>) -> Result<Option<Entry>, ClientError> {
        let id = id.into();
        self.request(|reply| Command::Clean { id, reply }).await
    }

    /// Drop a keep reason; entries left without reasons are removed.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn remove_reason(&self, reason: impl Into<String>) -> Result<Vec<Entry>, ClientError> {
        let reason = reason.into();
        self.request(|reply| Command::RemoveReason { reason, reply }).await
    }

    /// Subscribe to a server channel.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
        filter: Map<String, Value>,
    ) -> Result<Option<Meta>, ClientError> {
        let action = Subscription::new(channel, filter).to_action();
        self.add(action, Meta { sync: true, ..Meta::new() }).await
    }

    /// Unsubscribe from a server channel.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn unsubscribe(
        &self,
        channel: impl Into<String>,
        filter: Map<String, Value>,
    ) -> Result<Option<Meta>, ClientError> {
        let action = Subscription::new(channel, filter).to_unsubscribe();
        self.add(action, Meta { sync: true, ..Meta::new() }).await
    }

    /// Active subscriptions with their cursors.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, ClientError> {
        self.request(Command::Subscriptions).await
    }

    /// Switch every context of this client to another user.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub async fn change_user(&self, user: impl Into<String>) -> Result<(), ClientError> {
        let user = user.into();
        self.request(|reply| Command::ChangeUser { user, reply }).await
    }

    /// The context is about to unload: a leader clears its record now so the
    /// others re-elect without waiting for the leader timeout.
    ///
    /// # Errors
    /// Returns error if the context was destroyed.
    pub fn prepare_unload(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::PrepareUnload)
            .map_err(|_| ClientError::Closed)
    }

    /// Wait until the context holds `role`.
    ///
    /// # Errors
    /// Returns error if the context is destroyed first.
    pub async fn wait_for_role(&self, role: Role) -> Result<(), ClientError> {
        let mut watcher = self.role.clone();
        watcher
            .wait_for(|current| *current == role)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Wait until the connection state is `state`.
    ///
    /// # Errors
    /// Returns error if the context is destroyed first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), ClientError> {
        let mut watcher = self.state.clone();
        watcher
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Tear the context down: stop timers, clear the leader record if held,
    /// release the leader lock and close the connection.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Destroy(Some(reply))).is_ok() {
            let _ = done.await;
        }
    }

    /// Kill the runtime without any teardown, like a crashed tab.
    #[cfg(test)]
    pub(crate) fn abort(&self) {
        let _ = self.commands.send(Command::Crash);
    }
}

impl Drop for CrossTabClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Destroy(None));
    }
}
