//! Cross-tab client: one context holds the connection, the others mirror it.
//!
//! Provides:
//! - `CrossTabClient` - Per-context runtime wiring election, relay and timers
//! - `BroadcastRelay` - Log mutations mirrored between contexts
//! - `ResubscriptionManager` - Cursor-based resubscription after reconnect
//! - `SubprotocolNegotiator` - Version check between contexts

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod relay;
pub mod resubscribe;
pub mod subprotocol;

mod runtime;

pub use client::{ClientBuilder, CrossTabClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, EventHub};
pub use relay::BroadcastRelay;
pub use resubscribe::{ResubscriptionManager, Subscription};
pub use subprotocol::{Negotiation, SemVer, SubprotocolNegotiator};
