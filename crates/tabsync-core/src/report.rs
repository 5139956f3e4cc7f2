//! Error payload surfaced to observers through the `error` event.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Non-fatal error reported to UI observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable kind, e.g. `wrong-subprotocol`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable detail.
    pub description: String,
}

impl ErrorReport {
    /// Kind used when a peer runs a newer subprotocol.
    pub const WRONG_SUBPROTOCOL: &'static str = "wrong-subprotocol";

    /// Create a report.
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}
