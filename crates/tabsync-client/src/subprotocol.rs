//! Subprotocol version exchange between contexts.

use std::{cmp::Ordering, fmt, sync::Arc};

use tabsync_core::{ChannelError, ErrorReport, TabChannel, Topic, encode_subprotocol};

/// Three-part numeric version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    /// Parse `major[.minor[.patch]]`; missing parts are `0`.
    ///
    /// Returns `None` for anything non-numeric, pre-release suffixes included.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = [0_u64; 3];
        let mut count = 0;
        for part in raw.trim().split('.') {
            if count == parts.len() || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            parts[count] = part.parse().ok()?;
            count += 1;
        }
        let [major, minor, patch] = parts;
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Result of comparing a peer's version with ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Same version, or not comparable.
    Compatible,
    /// Peer is behind; our version was announced again.
    Reannounced,
    /// Peer is ahead of us.
    Incompatible(ErrorReport),
}

/// Announces this context's subprotocol and judges peers' announcements.
pub struct SubprotocolNegotiator {
    channel: Arc<TabChannel>,
    local: String,
}

impl SubprotocolNegotiator {
    /// Create a negotiator for the local version.
    #[must_use]
    pub fn new(channel: Arc<TabChannel>, local: impl Into<String>) -> Self {
        Self {
            channel,
            local: local.into(),
        }
    }

    /// Local version string.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Publish the local version.
    ///
    /// # Errors
    /// Returns error if the channel refuses the write.
    pub fn announce(&self) -> Result<(), ChannelError> {
        self.channel
            .publish(Topic::Subprotocol, &encode_subprotocol(&self.local)?)
    }

    /// React to a version announced by another context.
    ///
    /// # Errors
    /// Returns error if re-announcing fails.
    pub fn on_peer(&self, peer: &str) -> Result<Negotiation, ChannelError> {
        let (Some(local), Some(remote)) = (SemVer::parse(&self.local), SemVer::parse(peer)) else {
            tracing::debug!(local = %self.local, peer, "Subprotocol not comparable");
            return Ok(Negotiation::Compatible);
        };

        match local.cmp(&remote) {
            Ordering::Equal => Ok(Negotiation::Compatible),
            Ordering::Greater => {
                self.announce()?;
                Ok(Negotiation::Reannounced)
            }
            Ordering::Less => {
                tracing::warn!(local = %local, peer = %remote, "Peer uses a newer subprotocol");
                Ok(Negotiation::Incompatible(ErrorReport::new(
                    ErrorReport::WRONG_SUBPROTOCOL,
                    format!("Only {remote} subprotocol is supported, this context uses {local}"),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tabsync_core::{ContextId, KeySpace, MemoryChannel, SharedChannel};

    use super::*;

    fn negotiator(bus: &Arc<MemoryChannel>, id: &str, version: &str) -> SubprotocolNegotiator {
        let channel = Arc::new(TabChannel::new(
            ContextId::from(id),
            Arc::clone(bus) as Arc<dyn SharedChannel>,
            KeySpace::new("app", "1"),
        ));
        SubprotocolNegotiator::new(channel, version)
    }

    #[test]
    fn parses_partial_versions() {
        assert_eq!(SemVer::parse("1"), Some(SemVer { major: 1, minor: 0, patch: 0 }));
        assert_eq!(SemVer::parse("1.2"), Some(SemVer { major: 1, minor: 2, patch: 0 }));
        assert_eq!(SemVer::parse("1.2.3").map(|v| v.to_string()).as_deref(), Some("1.2.3"));
        assert_eq!(SemVer::parse("1.0.0-beta"), None);
        assert_eq!(SemVer::parse("1.2.3.4"), None);
        assert_eq!(SemVer::parse(""), None);
        assert!(SemVer::parse("1.10.0") > SemVer::parse("1.9.9"));
    }

    #[test]
    fn older_context_reports_error() {
        let bus = Arc::new(MemoryChannel::new());
        let a = negotiator(&bus, "a", "1.0.0");
        let b = negotiator(&bus, "b", "1.1.0");

        let Negotiation::Incompatible(report) = a.on_peer("1.1.0").unwrap() else {
            panic!("older version must be incompatible");
        };
        assert_eq!(report.kind, ErrorReport::WRONG_SUBPROTOCOL);

        assert_eq!(b.on_peer("1.0.0").unwrap(), Negotiation::Reannounced);
        assert_eq!(bus.read("app:1:subprotocol").unwrap().as_deref(), Some("\"1.1.0\""));
    }

    #[test]
    fn equal_and_prerelease_are_ignored() {
        let bus = Arc::new(MemoryChannel::new());
        let a = negotiator(&bus, "a", "1.0.0");
        assert_eq!(a.on_peer("1.0").unwrap(), Negotiation::Compatible);
        assert_eq!(a.on_peer("2.0.0-rc.1").unwrap(), Negotiation::Compatible);
        assert!(bus.read("app:1:subprotocol").unwrap().is_none());
    }
}
