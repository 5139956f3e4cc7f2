//! Leader heartbeat and follower-side failure detection.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tabsync_core::{ChannelError, Clock, LeaderRecord, TabChannel, Topic};

use crate::ElectionConfig;

/// Follower's verdict about the current leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Leader pinged recently enough.
    Alive,
    /// No leader, or its last ping is older than `leader_timeout`.
    Dead,
}

/// Publishes the leader's heartbeat and judges other leaders' heartbeats.
pub struct HeartbeatMonitor {
    channel: Arc<TabChannel>,
    clock: Arc<dyn Clock>,
    config: ElectionConfig,
    unloading: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(channel: Arc<TabChannel>, clock: Arc<dyn Clock>, config: ElectionConfig) -> Self {
        Self {
            channel,
            clock,
            config,
            unloading: false,
        }
    }

    /// Interval between leader pings.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.config.leader_ping
    }

    /// Mark the context as about to unload.
    pub const fn set_unloading(&mut self, unloading: bool) {
        self.unloading = unloading;
    }

    /// Whether the context is about to unload.
    #[must_use]
    pub const fn is_unloading(&self) -> bool {
        self.unloading
    }

    /// Leader tick: refresh the record, or clear it while unloading.
    ///
    /// # Errors
    /// Returns error if the record cannot be written.
    pub fn ping(&self) -> Result<(), ChannelError> {
        let record = (!self.unloading)
            .then(|| LeaderRecord::new(self.channel.id().clone(), self.clock.now_millis()));
        self.channel
            .publish(Topic::Leader, &LeaderRecord::encode(record.as_ref())?)
    }

    /// Randomized delay before the next follower check.
    ///
    /// Drawn from `[role_timeout / 2, role_timeout]` so followers do not
    /// all start elections at the same instant.
    #[must_use]
    pub fn role_timeout(&self) -> Duration {
        let full = u64::try_from(self.config.role_timeout.as_millis()).unwrap_or(u64::MAX);
        let millis = rand::thread_rng().gen_range(full / 2..=full);
        Duration::from_millis(millis)
    }

    /// Judge a leader record against `leader_timeout`.
    #[must_use]
    pub fn liveness(&self, record: Option<&LeaderRecord>) -> Liveness {
        let Some(record) = record else {
            return Liveness::Dead;
        };
        let age = self.clock.now_millis().saturating_sub(record.timestamp);
        let limit = u64::try_from(self.config.leader_timeout.as_millis()).unwrap_or(u64::MAX);
        if age > limit { Liveness::Dead } else { Liveness::Alive }
    }

    /// Follower tick: read the leader record and judge it.
    ///
    /// # Errors
    /// Returns error if the record cannot be read.
    pub fn check(&self) -> Result<Liveness, ChannelError> {
        let record = self.channel.read_leader()?;
        Ok(self.liveness(record.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use tabsync_core::{ContextId, InstantClock, KeySpace, MemoryChannel, SharedChannel};

    use super::*;

    fn monitor(bus: &Arc<MemoryChannel>, id: &str, clock: InstantClock) -> HeartbeatMonitor {
        let channel = Arc::new(TabChannel::new(
            ContextId::from(id),
            Arc::clone(bus) as Arc<dyn SharedChannel>,
            KeySpace::new("app", "1"),
        ));
        HeartbeatMonitor::new(channel, Arc::new(clock), ElectionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn ping_keeps_leader_alive() {
        let bus = Arc::new(MemoryChannel::new());
        let clock = InstantClock::new(10_000);
        let leader = monitor(&bus, "a", clock);
        let follower = monitor(&bus, "b", clock);

        assert_eq!(follower.check().unwrap(), Liveness::Dead);

        leader.ping().unwrap();
        assert_eq!(follower.check().unwrap(), Liveness::Alive);

        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(follower.check().unwrap(), Liveness::Alive);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(follower.check().unwrap(), Liveness::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn unloading_leader_clears_record() {
        let bus = Arc::new(MemoryChannel::new());
        let mut leader = monitor(&bus, "a", InstantClock::new(10_000));

        leader.ping().unwrap();
        assert_eq!(bus.read("app:1:leader").unwrap().as_deref(), Some(r#"["a",10000]"#));

        leader.set_unloading(true);
        leader.ping().unwrap();
        assert_eq!(bus.read("app:1:leader").unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn role_timeout_stays_in_window() {
        let bus = Arc::new(MemoryChannel::new());
        let follower = monitor(&bus, "b", InstantClock::new(0));
        for _ in 0..100 {
            let timeout = follower.role_timeout();
            assert!(timeout >= Duration::from_millis(1_500));
            assert!(timeout <= Duration::from_millis(3_000));
        }
    }
}
