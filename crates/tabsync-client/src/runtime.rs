//! Per-context event loop.
//!
//! One task owns every piece of mutable state of a context: the election
//! state machine, the heartbeat timers, the relay and the resubscription
//! table. Bus notifications, node events, timers and handle commands are
//! handled one at a time.

use std::sync::Arc;

use futures::future;
use tabsync_core::{
    Action, ChannelError, ChannelEvent, ChannelSubscription, ClientLog, Clock, ConnectionState, ContextId,
    Entry, Incoming, KeySpace, LogMutation, Meta, MetaIds, MutationKind, NodeEvent, ProtocolError,
    SharedChannel, SyncNode, TabChannel, Topic, encode_state, encode_user,
};
use tabsync_leader::{
    Acquisition, ElectionCoordinator, HeartbeatMonitor, LeaderSignal, Leadership, Liveness, LockError,
    LockGuard, LockWait, Role,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, sleep_until},
};

use crate::{
    BroadcastRelay, ClientConfig, ClientEvent, EventHub, Negotiation, ResubscriptionManager, Subscription,
    SubprotocolNegotiator,
};

/// Request from a client handle to its runtime.
pub(crate) enum Command {
    Add {
        action: Action,
        meta: Meta,
        reply: oneshot::Sender<Option<Meta>>,
    },
    Clean {
        id: String,
        reply: oneshot::Sender<Option<Entry>>,
    },
    RemoveReason {
        reason: String,
        reply: oneshot::Sender<Vec<Entry>>,
    },
    ChangeUser {
        user: String,
        reply: oneshot::Sender<()>,
    },
    PrepareUnload,
    Subscriptions(oneshot::Sender<Vec<Subscription>>),
    Destroy(Option<oneshot::Sender<()>>),
    /// Stop without any teardown, like a crashed tab.
    #[cfg(test)]
    Crash,
}

/// Everything a runtime is built from.
pub(crate) struct Wiring {
    pub id: ContextId,
    pub config: ClientConfig,
    pub bus: Arc<dyn SharedChannel>,
    pub node: Arc<dyn SyncNode>,
    pub clock: Arc<dyn Clock>,
    pub log: Arc<dyn ClientLog>,
    pub leadership: Leadership,
    pub events: EventHub,
}

/// Handle-side ends of a runtime's channels.
pub(crate) struct Handles {
    pub commands: mpsc::UnboundedSender<Command>,
    pub role: watch::Receiver<Role>,
    pub state: watch::Receiver<ConnectionState>,
}

pub(crate) struct Runtime {
    id: ContextId,
    user: String,
    channel: Arc<TabChannel>,
    clock: Arc<dyn Clock>,
    log: Arc<dyn ClientLog>,
    node: Arc<dyn SyncNode>,
    election: ElectionCoordinator,
    heartbeat: HeartbeatMonitor,
    relay: BroadcastRelay,
    resubscribe: ResubscriptionManager,
    subprotocol: SubprotocolNegotiator,
    ids: MetaIds,
    events: EventHub,
    role_tx: watch::Sender<Role>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    bus: Option<ChannelSubscription>,
    node_events: Option<broadcast::Receiver<NodeEvent>>,
    commands: mpsc::UnboundedReceiver<Command>,
    election_at: Option<Instant>,
    ping_at: Option<Instant>,
    watch_at: Option<Instant>,
    lock_wait: Option<LockWait>,
    lock_guard: Option<LockGuard>,
    state_loaded: bool,
    fallback_logged: bool,
}

impl Runtime {
    /// Build a runtime. Subscribes to the bus and the node right away so no
    /// notification is missed between construction and the first poll.
    pub(crate) fn new(wiring: Wiring) -> (Self, Handles) {
        let Wiring {
            id,
            config,
            bus,
            node,
            clock,
            log,
            leadership,
            events,
        } = wiring;

        let channel = Arc::new(TabChannel::new(
            id.clone(),
            bus,
            KeySpace::new(config.prefix.clone(), config.user_id.clone()),
        ));
        let subscription = channel
            .subscribe()
            .inspect_err(|e| tracing::debug!(tab = %id, "Bus subscription failed: {e}"))
            .ok();

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (role_tx, role) = watch::channel(Role::Candidate);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let runtime = Self {
            user: config.user_id.clone(),
            election: ElectionCoordinator::new(
                Arc::clone(&channel),
                Arc::clone(&clock),
                config.election,
                leadership,
            ),
            heartbeat: HeartbeatMonitor::new(Arc::clone(&channel), Arc::clone(&clock), config.election),
            relay: BroadcastRelay::new(Arc::clone(&channel)),
            resubscribe: ResubscriptionManager::new(),
            subprotocol: SubprotocolNegotiator::new(Arc::clone(&channel), config.subprotocol),
            ids: MetaIds::new(id.clone()),
            node_events: Some(node.subscribe()),
            id,
            channel,
            clock,
            log,
            node,
            events,
            role_tx,
            state_tx,
            state: ConnectionState::Disconnected,
            bus: subscription,
            commands,
            election_at: None,
            ping_at: None,
            watch_at: None,
            lock_wait: None,
            lock_guard: None,
            state_loaded: false,
            fallback_logged: false,
        };
        let handles = Handles {
            commands: commands_tx,
            role,
            state,
        };
        (runtime, handles)
    }

    pub(crate) async fn run(mut self) {
        self.start();

        loop {
            let election_at = self.election_at;
            let ping_at = self.ping_at;
            let watch_at = self.watch_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Destroy(reply)) => {
                        self.shutdown();
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    #[cfg(test)]
                    Some(Command::Crash) => break,
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_bus_event(&mut self.bus) => match event {
                    Some(event) => self.on_channel_event(event),
                    None => self.bus = None,
                },
                event = next_node_event(&mut self.node_events) => match event {
                    Ok(event) => self.on_node_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(tab = %self.id, skipped, "Node events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.node_events = None,
                },
                () = sleep_until_opt(election_at) => {
                    self.election_at = None;
                    self.conclude_election();
                }
                () = sleep_until_opt(ping_at) => {
                    self.ping_at = None;
                    self.ping();
                }
                () = sleep_until_opt(watch_at) => {
                    self.watch_at = None;
                    self.watch();
                }
                granted = wait_lock(&mut self.lock_wait) => {
                    self.lock_wait = None;
                    self.on_lock(granted);
                }
            }
        }

        tracing::info!(tab = %self.id, "Context destroyed");
    }

    fn start(&mut self) {
        tracing::info!(tab = %self.id, user = %self.user, "Context started");
        if !self.channel.is_available() {
            self.storage_failed(&ChannelError::Unavailable);
            return;
        }
        if let Err(e) = self.subprotocol.announce() {
            self.storage_failed(&e);
            return;
        }
        self.acquire();
    }

    fn role(&self) -> Role {
        self.election.role()
    }

    fn acquire(&mut self) {
        match self.election.acquire_leadership() {
            Ok(Acquisition::Granted) => self.apply_role(),
            Ok(Acquisition::Held(guard)) => self.on_lock(Ok(guard)),
            Ok(Acquisition::Pending(delay)) => {
                self.election_at = Some(Instant::now() + delay);
                self.apply_role();
            }
            Ok(Acquisition::Waiting(wait)) => {
                self.lock_wait = Some(wait);
                self.apply_role();
            }
            Err(e) => self.storage_failed(&e),
        }
    }

    fn elect(&mut self) {
        if self.heartbeat.is_unloading() || self.election_at.is_some() {
            return;
        }
        match self.election.start_election() {
            Ok(delay) => {
                tracing::debug!(tab = %self.id, "Election started");
                self.election_at = Some(Instant::now() + delay);
                self.apply_role();
            }
            Err(e) => self.storage_failed(&e),
        }
    }

    fn conclude_election(&mut self) {
        match self.election.conclude_election() {
            Ok(_) => self.apply_role(),
            Err(e) => self.storage_failed(&e),
        }
    }

    fn on_lock(&mut self, granted: Result<LockGuard, LockError>) {
        match granted {
            Ok(guard) => {
                tracing::debug!(tab = %self.id, lock = guard.name(), "Leader lock granted");
                self.lock_guard = Some(guard);
                self.election.lock_granted();
                self.apply_role();
            }
            Err(e) => {
                tracing::warn!(tab = %self.id, "{e}, using heartbeat election");
                self.election.use_heartbeat();
                self.acquire();
            }
        }
    }

    /// Publish the coordinator's role and apply its side effects.
    fn apply_role(&mut self) {
        let role = self.role();
        if *self.role_tx.borrow() == role {
            return;
        }
        self.role_tx.send_replace(role);
        tracing::info!(tab = %self.id, %role, "Role changed");
        self.events.emit(ClientEvent::Role(role));

        match role {
            Role::Leader => {
                self.watch_at = None;
                self.state_loaded = true;
                if self.election.uses_heartbeat() {
                    self.ping();
                }
                self.node.connect();
            }
            Role::Follower => {
                self.ping_at = None;
                self.leave_network();
                if !self.state_loaded {
                    self.state_loaded = true;
                    self.load_state();
                }
                if self.election.uses_heartbeat() {
                    self.arm_watch();
                }
            }
            Role::Candidate => {
                self.ping_at = None;
                self.watch_at = None;
                self.leave_network();
            }
        }
    }

    fn leave_network(&mut self) {
        self.node.disconnect();
        self.resubscribe.on_state(ConnectionState::Disconnected);
    }

    /// Mirror the state the current leader stored before this context joined.
    fn load_state(&mut self) {
        let stored = match self.channel.read(Topic::State) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!(tab = %self.id, "Cannot read leader state: {e}");
                return;
            }
        };
        if let Some(Ok(Incoming::State(state))) = stored.map(|raw| Incoming::decode(Topic::State, &raw)) {
            self.set_state(state);
        }
    }

    fn arm_watch(&mut self) {
        self.watch_at = Some(Instant::now() + self.heartbeat.role_timeout());
    }

    fn ping(&mut self) {
        if self.role() != Role::Leader || !self.election.uses_heartbeat() {
            return;
        }
        match self.heartbeat.ping() {
            Ok(()) => self.ping_at = Some(Instant::now() + self.heartbeat.ping_interval()),
            Err(e) => self.storage_failed(&e),
        }
    }

    fn watch(&mut self) {
        if self.role() != Role::Follower || !self.election.uses_heartbeat() {
            return;
        }
        match self.heartbeat.check() {
            Ok(Liveness::Alive) => self.arm_watch(),
            Ok(Liveness::Dead) if self.heartbeat.is_unloading() => {}
            Ok(Liveness::Dead) => {
                tracing::info!(tab = %self.id, "Leader is gone, starting election");
                self.set_state(ConnectionState::Disconnected);
                self.elect();
            }
            Err(e) => self.storage_failed(&e),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        tracing::debug!(tab = %self.id, %state, "State changed");
        self.events.emit(ClientEvent::State(state));
    }

    /// Storage refused an operation: lead alone from now on.
    fn storage_failed(&mut self, err: &ChannelError) {
        self.channel.disable();
        self.bus = None;
        self.election_at = None;
        self.ping_at = None;
        self.watch_at = None;
        self.lock_wait = None;
        if !self.fallback_logged {
            self.fallback_logged = true;
            tracing::warn!(tab = %self.id, "{err}, cross-tab sync disabled");
        }
        self.election.fall_back();
        self.apply_role();
    }

    fn publish(&mut self, topic: Topic, value: Result<String, ProtocolError>) {
        if !self.channel.is_available() {
            return;
        }
        let result = value
            .map_err(ChannelError::from)
            .and_then(|value| self.channel.publish(topic, &value));
        if let Err(e) = result {
            self.storage_failed(&e);
        }
    }

    fn publish_mutation(&mut self, kind: MutationKind, action: &Action, meta: &Meta) {
        if let Err(e) = self.relay.publish(kind, action, meta) {
            self.storage_failed(&e);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        let Some(topic) = self.channel.topic_of(&event.key) else {
            return;
        };
        let incoming = match Incoming::decode(topic, &event.value) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(tab = %self.id, writer = %event.writer, "Ignoring message: {e}");
                return;
            }
        };

        match incoming {
            Incoming::Leader(record) => match self.election.on_leader_record(record.as_ref()) {
                Ok(LeaderSignal::Elect) => {
                    tracing::info!(tab = %self.id, "Leader resigned");
                    self.elect();
                }
                Ok(LeaderSignal::Yield) => {
                    tracing::info!(tab = %self.id, holder = %event.writer, "Newer leader claim, stepping down");
                    self.apply_role();
                }
                Ok(LeaderSignal::Ignore) => {}
                Err(e) => self.storage_failed(&e),
            },
            Incoming::State(state) => {
                if self.role() != Role::Leader {
                    self.set_state(state);
                }
            }
            Incoming::Mutation(mutation) => {
                if let Some(applied) = self.relay.receive(mutation, self.log.as_ref()) {
                    self.on_remote_mutation(applied);
                }
            }
            Incoming::User { origin, user } => {
                if origin != self.id && user != self.user {
                    self.switch_user(user);
                }
            }
            Incoming::Subprotocol(version) => match self.subprotocol.on_peer(&version) {
                Ok(Negotiation::Incompatible(report)) => self.events.emit(ClientEvent::Error(report)),
                Ok(_) => {}
                Err(e) => self.storage_failed(&e),
            },
        }
    }

    fn on_remote_mutation(&mut self, mutation: LogMutation) {
        let LogMutation { kind, action, meta, .. } = mutation;
        match kind {
            MutationKind::Add => {
                self.resubscribe.observe(&action, &meta);
                self.forward(&action, &meta);
                self.events.emit(ClientEvent::Add { action, meta });
            }
            MutationKind::Clean => self.events.emit(ClientEvent::Clean { action, meta }),
        }
    }

    fn on_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::State(state) => {
                if self.role() != Role::Leader {
                    return;
                }
                self.set_state(state);
                self.publish(Topic::State, encode_state(state));
                for request in self.resubscribe.on_state(state) {
                    let mut meta = Meta::new().synced();
                    self.ids.fill(&mut meta, self.clock.now_millis());
                    self.resubscribe.track(&request, &meta);
                    self.node.send(&request, &meta);
                }
            }
            NodeEvent::Received { action, meta } => {
                if self.role() != Role::Leader {
                    return;
                }
                if meta.tab.as_ref().is_some_and(|tab| tab != &self.id) {
                    self.resubscribe.observe(&action, &meta);
                    self.publish_mutation(MutationKind::Add, &action, &meta);
                    return;
                }
                if !self.log.add(action.clone(), meta.clone()) {
                    return;
                }
                self.resubscribe.observe(&action, &meta);
                self.publish_mutation(MutationKind::Add, &action, &meta);
                self.events.emit(ClientEvent::Add { action, meta });
            }
            NodeEvent::Error(report) => self.events.emit(ClientEvent::Error(report)),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Add { action, meta, reply } => {
                let _ = reply.send(self.add(action, meta));
            }
            Command::Clean { id, reply } => {
                let removed = self.log.clean(&id);
                if let Some(entry) = &removed {
                    self.cleaned(entry.clone());
                }
                let _ = reply.send(removed);
            }
            Command::RemoveReason { reason, reply } => {
                let removed = self.log.remove_reason(&reason);
                for entry in &removed {
                    self.cleaned(entry.clone());
                }
                let _ = reply.send(removed);
            }
            Command::ChangeUser { user, reply } => {
                self.change_user(user);
                let _ = reply.send(());
            }
            Command::PrepareUnload => {
                tracing::debug!(tab = %self.id, "Preparing to unload");
                self.heartbeat.set_unloading(true);
                self.watch_at = None;
                self.ping();
            }
            Command::Subscriptions(reply) => {
                let _ = reply.send(self.resubscribe.subscriptions());
            }
            Command::Destroy(_) => {}
            #[cfg(test)]
            Command::Crash => {}
        }
    }

    fn add(&mut self, action: Action, mut meta: Meta) -> Option<Meta> {
        self.ids.fill(&mut meta, self.clock.now_millis());
        if !self.log.add(action.clone(), meta.clone()) {
            tracing::debug!(tab = %self.id, id = %meta.id, "Duplicate action skipped");
            return None;
        }
        self.resubscribe.observe(&action, &meta);
        self.publish_mutation(MutationKind::Add, &action, &meta);
        self.forward(&action, &meta);
        self.events.emit(ClientEvent::Add {
            action,
            meta: meta.clone(),
        });
        Some(meta)
    }

    /// Hand a `sync` entry to the server while leading.
    fn forward(&self, action: &Action, meta: &Meta) {
        if meta.sync && self.role() == Role::Leader {
            self.node.send(action, meta);
        }
    }

    fn cleaned(&mut self, entry: Entry) {
        self.publish_mutation(MutationKind::Clean, &entry.action, &entry.meta);
        self.events.emit(ClientEvent::Clean {
            action: entry.action,
            meta: entry.meta,
        });
    }

    fn change_user(&mut self, user: String) {
        if user == self.user {
            return;
        }
        self.publish(Topic::User, encode_user(&self.id, &user));
        self.switch_user(user);
    }

    fn switch_user(&mut self, user: String) {
        tracing::info!(tab = %self.id, from = %self.user, to = %user, "User changed");
        self.channel.set_user(&user);
        self.node.change_user(&user);
        self.user.clone_from(&user);
        self.events.emit(ClientEvent::User(user));

        if self.channel.is_available() {
            if let Err(e) = self.subprotocol.announce() {
                self.storage_failed(&e);
                return;
            }
        }
        if self.role() == Role::Leader {
            self.ping();
        }
    }

    fn shutdown(&mut self) {
        self.election_at = None;
        self.ping_at = None;
        self.watch_at = None;
        self.lock_wait = None;

        if let Err(e) = self.election.resign() {
            tracing::debug!(tab = %self.id, "Cannot clear leader record: {e}");
        }
        self.lock_guard = None;
        self.bus = None;
        self.node.disconnect();

        if *self.role_tx.borrow() != Role::Follower {
            self.role_tx.send_replace(Role::Follower);
            self.events.emit(ClientEvent::Role(Role::Follower));
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_bus_event(bus: &mut Option<ChannelSubscription>) -> Option<ChannelEvent> {
    match bus {
        Some(bus) => bus.recv().await,
        None => future::pending().await,
    }
}

async fn next_node_event(
    events: &mut Option<broadcast::Receiver<NodeEvent>>,
) -> Result<NodeEvent, broadcast::error::RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}

async fn wait_lock(wait: &mut Option<LockWait>) -> Result<LockGuard, LockError> {
    match wait {
        Some(wait) => wait.await,
        None => future::pending().await,
    }
}
