//! Client errors.

use tabsync_leader::ConfigError;

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Client runtime has stopped")]
    Closed,
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
