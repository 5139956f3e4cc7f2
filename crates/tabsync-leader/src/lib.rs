//! Leader election among contexts sharing one channel.
//!
//! Provides:
//! - `ElectionCoordinator` - Candidate, follower and leader transitions
//! - `HeartbeatMonitor` - Leader pings and dead-leader detection
//! - `LeaderLock` - Exclusive-lock leadership where a lock primitive exists

pub mod config;
pub mod election;
pub mod heartbeat;
pub mod lock;
pub mod role;

pub use config::{ConfigError, ElectionConfig};
pub use election::{Acquisition, ElectionCoordinator, LeaderSignal, Leadership, LockWait};
pub use heartbeat::{HeartbeatMonitor, Liveness};
pub use lock::{LeaderLock, LockError, LockGuard, NamedLocks};
pub use role::Role;
