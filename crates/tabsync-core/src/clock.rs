//! Millisecond clocks used for leader timestamps and action times.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Reads the operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Wall-clock anchored to tokio's monotonic `Instant`.
///
/// Follows tokio's paused test clock, so heartbeat timestamps and timers
/// agree when time is advanced artificially. Share one instance between
/// every context of a test.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    origin: Instant,
    base_millis: u64,
}

impl InstantClock {
    /// Anchor the clock at the current instant, reading `base_millis` there.
    #[must_use]
    pub fn new(base_millis: u64) -> Self {
        Self {
            origin: Instant::now(),
            base_millis,
        }
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new(SystemClock.now_millis())
    }
}

impl Clock for InstantClock {
    fn now_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.base_millis.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn instant_clock_follows_paused_time() {
        let clock = InstantClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_millis(), 1_250);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
