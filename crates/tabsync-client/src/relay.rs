//! Mirrors log mutations between contexts.

use std::sync::Arc;

use tabsync_core::{Action, ChannelError, ClientLog, LogMutation, Meta, MutationKind, TabChannel};

/// Publishes local log mutations and applies remote ones.
///
/// Remote mutations are applied at most once: the log rejects ids it has
/// already seen, and mutations restricted to another context are skipped.
pub struct BroadcastRelay {
    channel: Arc<TabChannel>,
}

impl BroadcastRelay {
    /// Create a relay for one context.
    #[must_use]
    pub const fn new(channel: Arc<TabChannel>) -> Self {
        Self { channel }
    }

    /// Publish a mutation made in this context.
    ///
    /// Returns `false` when nothing was published: the entry is restricted
    /// to this context, or cross-tab relay is off.
    ///
    /// # Errors
    /// Returns error if the channel refuses the write.
    pub fn publish(&self, kind: MutationKind, action: &Action, meta: &Meta) -> Result<bool, ChannelError> {
        if meta.tab.as_ref() == Some(self.channel.id()) || !self.channel.is_available() {
            return Ok(false);
        }
        let mutation = LogMutation {
            kind,
            origin: self.channel.id().clone(),
            action: action.clone(),
            meta: meta.clone(),
        };
        self.channel.publish(kind.topic(), &mutation.encode()?)?;
        tracing::debug!(tab = %self.channel.id(), id = %meta.id, ?kind, "Mutation published");
        Ok(true)
    }

    /// Apply a mutation received from another context.
    ///
    /// Returns the mutation if it changed the local log.
    pub fn receive(&self, mutation: LogMutation, log: &dyn ClientLog) -> Option<LogMutation> {
        let id = self.channel.id();
        if &mutation.origin == id {
            return None;
        }
        if mutation.meta.tab.as_ref().is_some_and(|tab| tab != id) {
            return None;
        }

        let applied = match mutation.kind {
            MutationKind::Add => log.add(mutation.action.clone(), mutation.meta.clone()),
            MutationKind::Clean => log.clean(&mutation.meta.id).is_some(),
        };
        if !applied {
            tracing::debug!(tab = %id, id = %mutation.meta.id, "Mutation already applied");
        }
        applied.then_some(mutation)
    }
}
