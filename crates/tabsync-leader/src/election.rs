//! Candidate / follower / leader state machine of one context.
//!
//! Two ways to become leader sit behind `acquire_leadership`:
//!
//! 1. Heartbeat race: write `[self, now]` to the leader key, wait
//!    `election_delay`, read it back. Whoever wrote last wins. Two contexts
//!    can briefly both believe they lead; the leader that sees a newer claim
//!    yields, so the later write survives.
//! 2. Exclusive lock: take a free `LeaderLock` at once or wait for it, lead
//!    while holding it. A failing lock primitive falls back to the race.
//!
//! A context without a working channel leads unconditionally.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tabsync_core::{ChannelError, Clock, LeaderRecord, TabChannel, Topic};

use crate::{ElectionConfig, LeaderLock, LockError, LockGuard, Role};

/// Pending lock acquisition.
pub type LockWait = BoxFuture<'static, Result<LockGuard, LockError>>;

/// How leadership is obtained.
#[derive(Clone, Default)]
pub enum Leadership {
    /// Storage race refreshed by heartbeats.
    #[default]
    Heartbeat,
    /// Exclusive lock held until destroy.
    Lock(Arc<dyn LeaderLock>),
}

impl fmt::Debug for Leadership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat => f.write_str("Heartbeat"),
            Self::Lock(_) => f.write_str("Lock"),
        }
    }
}

/// Outcome of starting to acquire leadership.
pub enum Acquisition {
    /// Leader right away.
    Granted,
    /// The leader lock was free: leader while this guard is held.
    Held(LockGuard),
    /// Claim written; call `conclude_election` after this delay.
    Pending(Duration),
    /// Follower until the lock future resolves.
    Waiting(LockWait),
}

impl fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => f.write_str("Granted"),
            Self::Held(guard) => f.debug_tuple("Held").field(guard).finish(),
            Self::Pending(delay) => f.debug_tuple("Pending").field(delay).finish(),
            Self::Waiting(_) => f.write_str("Waiting"),
        }
    }
}

/// Reaction to another context's leader record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderSignal {
    /// Nothing to do.
    Ignore,
    /// Leader resigned: start an election now.
    Elect,
    /// A newer claim exists: this leader stepped down to follower.
    Yield,
}

/// Runs the election protocol for one context.
pub struct ElectionCoordinator {
    channel: Arc<TabChannel>,
    clock: Arc<dyn Clock>,
    config: ElectionConfig,
    leadership: Leadership,
    role: Role,
}

impl ElectionCoordinator {
    /// Create a coordinator in the `Candidate` role.
    #[must_use]
    pub fn new(
        channel: Arc<TabChannel>,
        clock: Arc<dyn Clock>,
        config: ElectionConfig,
        leadership: Leadership,
    ) -> Self {
        Self {
            channel,
            clock,
            config,
            leadership,
            role: Role::Candidate,
        }
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Whether leadership is decided by the heartbeat race.
    #[must_use]
    pub fn uses_heartbeat(&self) -> bool {
        matches!(self.leadership, Leadership::Heartbeat) && self.channel.is_available()
    }

    /// Start acquiring leadership with the configured mechanism.
    ///
    /// # Errors
    /// Returns error if the claim cannot be written.
    pub fn acquire_leadership(&mut self) -> Result<Acquisition, ChannelError> {
        if !self.channel.is_available() {
            self.role = Role::Leader;
            return Ok(Acquisition::Granted);
        }

        match &self.leadership {
            Leadership::Lock(lock) => {
                let lock = Arc::clone(lock);
                let name = self.channel.keys().key(Topic::Leader);
                match lock.try_acquire(&name) {
                    Ok(Some(guard)) => {
                        self.role = Role::Leader;
                        Ok(Acquisition::Held(guard))
                    }
                    Ok(None) => {
                        self.role = Role::Follower;
                        Ok(Acquisition::Waiting(Box::pin(async move {
                            lock.acquire(&name).await
                        })))
                    }
                    Err(e) => {
                        tracing::warn!(tab = %self.channel.id(), "{e}, using heartbeat election");
                        self.use_heartbeat();
                        self.start_election().map(Acquisition::Pending)
                    }
                }
            }
            Leadership::Heartbeat => self.start_election().map(Acquisition::Pending),
        }
    }

    /// Write a claim and become `Candidate`. Returns the election delay.
    ///
    /// # Errors
    /// Returns error if the claim cannot be written.
    pub fn start_election(&mut self) -> Result<Duration, ChannelError> {
        self.role = Role::Candidate;
        let claim = LeaderRecord::new(self.channel.id().clone(), self.clock.now_millis());
        self.channel
            .publish(Topic::Leader, &LeaderRecord::encode(Some(&claim))?)?;
        tracing::debug!(tab = %self.channel.id(), "Leadership claimed");
        Ok(self.config.election_delay)
    }

    /// Read the claim back after the election delay.
    ///
    /// # Errors
    /// Returns error if the leader record cannot be read.
    pub fn conclude_election(&mut self) -> Result<Role, ChannelError> {
        if self.role != Role::Candidate {
            return Ok(self.role);
        }
        let record = self.channel.read_leader()?;
        let won = record.is_some_and(|r| &r.holder == self.channel.id());
        self.role = if won { Role::Leader } else { Role::Follower };
        Ok(self.role)
    }

    /// The exclusive lock was granted.
    pub fn lock_granted(&mut self) {
        self.role = Role::Leader;
    }

    /// Switch to the heartbeat race, e.g. when the lock primitive failed.
    pub fn use_heartbeat(&mut self) {
        self.leadership = Leadership::Heartbeat;
    }

    /// Lead without any coordination: the channel stopped working.
    pub fn fall_back(&mut self) {
        self.role = Role::Leader;
    }

    /// React to a leader record written by another context.
    ///
    /// Notifications may arrive after newer writes, so a leader only steps
    /// down when the stored record still names someone else.
    ///
    /// # Errors
    /// Returns error if the leader record cannot be read.
    pub fn on_leader_record(&mut self, record: Option<&LeaderRecord>) -> Result<LeaderSignal, ChannelError> {
        if !self.uses_heartbeat() {
            return Ok(LeaderSignal::Ignore);
        }
        match (self.role, record) {
            (Role::Follower, None) => Ok(LeaderSignal::Elect),
            (Role::Leader, Some(claim)) if &claim.holder != self.channel.id() => {
                if self.holds_record()? {
                    return Ok(LeaderSignal::Ignore);
                }
                self.role = Role::Follower;
                Ok(LeaderSignal::Yield)
            }
            _ => Ok(LeaderSignal::Ignore),
        }
    }

    fn holds_record(&self) -> Result<bool, ChannelError> {
        let stored = self.channel.read_leader()?;
        Ok(stored.is_some_and(|r| &r.holder == self.channel.id()))
    }

    /// Give up leadership. If the leader record still names this context,
    /// whether leading or mid-election, it is cleared so peers re-elect now.
    ///
    /// # Errors
    /// Returns error if the record cannot be read or cleared.
    pub fn resign(&mut self) -> Result<(), ChannelError> {
        self.role = Role::Follower;
        if self.uses_heartbeat() && self.holds_record()? {
            self.channel
                .publish(Topic::Leader, &LeaderRecord::encode(None)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tabsync_core::{ContextId, InstantClock, KeySpace, MemoryChannel, SharedChannel};

    use super::*;
    use crate::NamedLocks;

    fn coordinator(bus: &Arc<MemoryChannel>, id: &str, leadership: Leadership) -> ElectionCoordinator {
        let channel = Arc::new(TabChannel::new(
            ContextId::from(id),
            Arc::clone(bus) as Arc<dyn SharedChannel>,
            KeySpace::new("app", "1"),
        ));
        ElectionCoordinator::new(
            channel,
            Arc::new(InstantClock::new(1_000)),
            ElectionConfig::default(),
            leadership,
        )
    }

    #[tokio::test]
    async fn last_claim_wins() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);

        assert!(matches!(b.acquire_leadership().unwrap(), Acquisition::Pending(_)));
        assert!(matches!(a.acquire_leadership().unwrap(), Acquisition::Pending(_)));
        assert_eq!(a.role(), Role::Candidate);

        assert_eq!(b.conclude_election().unwrap(), Role::Follower);
        assert_eq!(a.conclude_election().unwrap(), Role::Leader);
    }

    #[tokio::test]
    async fn no_channel_means_leader() {
        let bus = Arc::new(MemoryChannel::disabled());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.channel.disable();

        assert!(matches!(a.acquire_leadership().unwrap(), Acquisition::Granted));
        assert_eq!(a.role(), Role::Leader);
    }

    #[tokio::test]
    async fn follower_elects_on_resignation() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.acquire_leadership().unwrap();
        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);
        b.acquire_leadership().unwrap();
        b.conclude_election().unwrap();
        a.conclude_election().unwrap();
        assert_eq!(a.role(), Role::Follower);

        assert_eq!(a.on_leader_record(None).unwrap(), LeaderSignal::Elect);
        let claim = LeaderRecord::new(ContextId::from("b"), 2_000);
        assert_eq!(a.on_leader_record(Some(&claim)).unwrap(), LeaderSignal::Ignore);
    }

    #[tokio::test]
    async fn leader_yields_to_newer_claim() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.acquire_leadership().unwrap();
        assert_eq!(a.conclude_election().unwrap(), Role::Leader);

        let own = LeaderRecord::new(ContextId::from("a"), 2_000);
        assert_eq!(a.on_leader_record(Some(&own)).unwrap(), LeaderSignal::Ignore);

        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);
        b.start_election().unwrap();
        let other = LeaderRecord::new(ContextId::from("b"), 1_000);
        assert_eq!(a.on_leader_record(Some(&other)).unwrap(), LeaderSignal::Yield);
        assert_eq!(a.role(), Role::Follower);
    }

    #[tokio::test]
    async fn leader_keeps_role_when_claim_was_overwritten() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.acquire_leadership().unwrap();
        assert_eq!(a.conclude_election().unwrap(), Role::Leader);

        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);
        b.start_election().unwrap();
        // Heartbeat lands before the claim's notification is handled.
        let ping = LeaderRecord::new(ContextId::from("a"), 1_000);
        a.channel
            .publish(Topic::Leader, &LeaderRecord::encode(Some(&ping)).unwrap())
            .unwrap();

        let claim = LeaderRecord::new(ContextId::from("b"), 1_000);
        assert_eq!(a.on_leader_record(Some(&claim)).unwrap(), LeaderSignal::Ignore);
        assert_eq!(a.role(), Role::Leader);
        assert_eq!(b.conclude_election().unwrap(), Role::Follower);
    }

    #[tokio::test]
    async fn resign_clears_record() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.acquire_leadership().unwrap();
        a.conclude_election().unwrap();

        a.resign().unwrap();
        assert_eq!(bus.read("app:1:leader").unwrap().as_deref(), Some("[]"));
        assert_eq!(a.role(), Role::Follower);
    }

    #[tokio::test]
    async fn candidate_resign_clears_own_claim() {
        let bus = Arc::new(MemoryChannel::new());
        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);
        b.start_election().unwrap();
        assert_eq!(b.role(), Role::Candidate);

        b.resign().unwrap();
        assert_eq!(bus.read("app:1:leader").unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn resign_keeps_someone_elses_claim() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Heartbeat);
        a.start_election().unwrap();
        let mut b = coordinator(&bus, "b", Leadership::Heartbeat);
        b.start_election().unwrap();
        let claim = bus.read("app:1:leader").unwrap();

        a.resign().unwrap();
        assert_eq!(bus.read("app:1:leader").unwrap(), claim);
    }

    #[tokio::test]
    async fn lock_leadership_waits_for_holder() {
        let bus = Arc::new(MemoryChannel::new());
        let locks: Arc<dyn LeaderLock> = Arc::new(NamedLocks::new());
        let mut a = coordinator(&bus, "a", Leadership::Lock(Arc::clone(&locks)));
        let mut b = coordinator(&bus, "b", Leadership::Lock(locks));

        let Acquisition::Held(guard) = a.acquire_leadership().unwrap() else {
            panic!("free lock must be taken at once");
        };
        assert_eq!(a.role(), Role::Leader);

        let Acquisition::Waiting(wait_b) = b.acquire_leadership().unwrap() else {
            panic!("lock leadership must wait");
        };
        assert_eq!(b.role(), Role::Follower);
        let mut wait_b = tokio_test::task::spawn(wait_b);
        tokio_test::assert_pending!(wait_b.poll());

        drop(guard);
        assert!(tokio_test::assert_ready!(wait_b.poll()).is_ok());
        assert!(bus.read("app:1:leader").unwrap().is_none());
    }

    struct BrokenLock;

    #[async_trait::async_trait]
    impl LeaderLock for BrokenLock {
        async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
            Err(LockError::Unavailable(name.to_owned()))
        }

        fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
            Err(LockError::Unavailable(name.to_owned()))
        }
    }

    #[tokio::test]
    async fn broken_lock_falls_back_to_election() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Lock(Arc::new(BrokenLock)));

        assert!(matches!(a.acquire_leadership().unwrap(), Acquisition::Pending(_)));
        assert!(a.uses_heartbeat());
        assert_eq!(a.role(), Role::Candidate);
        assert!(bus.read("app:1:leader").unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_failure_switches_to_heartbeat() {
        let bus = Arc::new(MemoryChannel::new());
        let mut a = coordinator(&bus, "a", Leadership::Lock(Arc::new(NamedLocks::new())));
        assert!(!a.uses_heartbeat());

        a.use_heartbeat();
        assert!(a.uses_heartbeat());
        assert!(matches!(a.acquire_leadership().unwrap(), Acquisition::Pending(_)));
    }
}
