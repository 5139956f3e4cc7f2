//! Exclusive-lock leadership.
//!
//! Where the platform offers a real mutual-exclusion primitive, holding the
//! lock *is* leadership: no heartbeat race, no double-leader window. The lock
//! is held until the guard is dropped.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Lock error.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {0} is unavailable")]
    Unavailable(String),
}

/// Proof of holding a named lock. Dropping it releases the lock.
pub struct LockGuard {
    name: String,
    _held: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    /// Wrap whatever keeps the lock held.
    #[must_use]
    pub fn new(name: impl Into<String>, held: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            _held: Box::new(held),
        }
    }

    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Exclusive named lock shared by every context.
#[async_trait]
pub trait LeaderLock: Send + Sync + 'static {
    /// Wait until the lock is free and take it.
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;

    /// Take the lock if it is free right now.
    ///
    /// # Errors
    /// Returns error if the lock primitive is unavailable.
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError>;
}

/// In-process lock registry, one async mutex per name.
///
/// Suits contexts hosted as tasks of one process.
#[derive(Default, Clone)]
pub struct NamedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NamedLocks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[async_trait]
impl LeaderLock for NamedLocks {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let held = self.slot(name).lock_owned().await;
        tracing::debug!(lock = name, "Lock acquired");
        Ok(LockGuard::new(name, held))
    }

    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        Ok(self
            .slot(name)
            .try_lock_owned()
            .ok()
            .map(|held| LockGuard::new(name, held)))
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[test]
    fn second_holder_waits_for_release() {
        let locks = NamedLocks::new();
        let first = locks.try_acquire("app:leader").unwrap().unwrap();
        assert_eq!(first.name(), "app:leader");

        let mut second = task::spawn(locks.acquire("app:leader"));
        assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let guard = assert_ready!(second.poll()).unwrap();
        assert_eq!(guard.name(), "app:leader");
    }

    #[test]
    fn names_are_independent() {
        let locks = NamedLocks::new();
        let _a = locks.try_acquire("a").unwrap().unwrap();
        assert!(locks.try_acquire("a").unwrap().is_none());
        assert!(locks.try_acquire("b").unwrap().is_some());
    }
}
