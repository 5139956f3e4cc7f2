//! Role of a context in the election.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Election in progress.
    #[default]
    Candidate,
    /// Mirrors the leader's state.
    Follower,
    /// Holds the network connection.
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Candidate => "candidate",
            Self::Follower => "follower",
            Self::Leader => "leader",
        })
    }
}
