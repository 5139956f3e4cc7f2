//! Client configuration.

use serde::{Deserialize, Serialize};
use tabsync_leader::ElectionConfig;

use crate::ClientError;

/// Configuration of one cross-tab client.
///
/// Every field has a default, so a host can load a partial JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Application prefix of every shared key.
    pub prefix: String,
    /// Current user; part of every shared key.
    pub user_id: String,
    /// Version of the application's action protocol.
    pub subprotocol: String,
    /// Election timings.
    pub election: ElectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prefix: "tabsync".into(),
            user_id: "anonymous".into(),
            subprotocol: "1.0.0".into(),
            election: ElectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Config for a user with default everything else.
    #[must_use]
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Set the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the subprotocol version.
    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    /// Set the election timings.
    #[must_use]
    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns error if the key namespace would be ambiguous or a timing is
    /// invalid.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.prefix.is_empty() {
            return Err(ClientError::Config("prefix must not be empty".into()));
        }
        if self.prefix.contains(':') {
            return Err(ClientError::Config("prefix must not contain ':'".into()));
        }
        if self.user_id.is_empty() {
            return Err(ClientError::Config("user_id must not be empty".into()));
        }
        if self.subprotocol.is_empty() {
            return Err(ClientError::Config("subprotocol must not be empty".into()));
        }
        self.election.validate()?;
        Ok(())
    }
}
