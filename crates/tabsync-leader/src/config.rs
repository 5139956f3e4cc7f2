//! Election timing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Election and heartbeat timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ElectionConfig {
    /// Time between writing a claim and checking who won.
    /// Default: 1000ms
    #[serde(rename = "electionDelayMs", with = "millis")]
    pub election_delay: Duration,

    /// Age after which a leader record counts as dead.
    /// Default: 5000ms
    #[serde(rename = "leaderTimeoutMs", with = "millis")]
    pub leader_timeout: Duration,

    /// Interval between leader heartbeats.
    /// Default: 2000ms
    #[serde(rename = "leaderPingMs", with = "millis")]
    pub leader_ping: Duration,

    /// Upper bound of the randomized follower check interval.
    /// Default: 3000ms
    #[serde(rename = "roleTimeoutMs", with = "millis")]
    pub role_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_delay: Duration::from_millis(1000),
            leader_timeout: Duration::from_millis(5000),
            leader_ping: Duration::from_millis(2000),
            role_timeout: Duration::from_millis(3000),
        }
    }
}

impl ElectionConfig {
    /// Create a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the election delay.
    #[must_use]
    pub const fn with_election_delay(mut self, delay: Duration) -> Self {
        self.election_delay = delay;
        self
    }

    /// Set the leader timeout.
    #[must_use]
    pub const fn with_leader_timeout(mut self, timeout: Duration) -> Self {
        self.leader_timeout = timeout;
        self
    }

    /// Set the leader ping interval.
    #[must_use]
    pub const fn with_leader_ping(mut self, interval: Duration) -> Self {
        self.leader_ping = interval;
        self
    }

    /// Set the follower role timeout.
    #[must_use]
    pub const fn with_role_timeout(mut self, timeout: Duration) -> Self {
        self.role_timeout = timeout;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns error if a timing is zero or the leader would time out
    /// between two of its own pings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_delay.is_zero() {
            return Err(ConfigError::InvalidValue("election_delay must be > 0".into()));
        }
        if self.leader_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("leader_timeout must be > 0".into()));
        }
        if self.leader_ping.is_zero() {
            return Err(ConfigError::InvalidValue("leader_ping must be > 0".into()));
        }
        if self.role_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("role_timeout must be > 0".into()));
        }
        if self.leader_ping >= self.leader_timeout {
            return Err(ConfigError::InvalidValue(
                "leader_ping must be < leader_timeout".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ElectionConfig::default();
        assert_eq!(config.election_delay, Duration::from_millis(1000));
        assert_eq!(config.leader_timeout, Duration::from_millis(5000));
        assert_eq!(config.leader_ping, Duration::from_millis(2000));
        assert_eq!(config.role_timeout, Duration::from_millis(3000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_delay_is_invalid() {
        let config = ElectionConfig::default().with_election_delay(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ping_must_be_shorter_than_timeout() {
        let config = ElectionConfig::default()
            .with_leader_ping(Duration::from_millis(500))
            .with_leader_timeout(Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_millisecond_fields() {
        let config: ElectionConfig =
            serde_json::from_str(r#"{"electionDelayMs": 100, "leaderPingMs": 50}"#).unwrap();
        assert_eq!(config.election_delay, Duration::from_millis(100));
        assert_eq!(config.leader_ping, Duration::from_millis(50));
        assert_eq!(config.leader_timeout, Duration::from_millis(5000));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["roleTimeoutMs"], 3000);
    }
}
