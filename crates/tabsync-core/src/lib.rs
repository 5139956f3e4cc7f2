//! Core building blocks for cross-tab coordination.
//!
//! This crate provides:
//! - `SharedChannel` - Notify-on-write bus shared by every context
//! - `TabChannel` - One context's namespaced view of the bus
//! - Wire codec for every key the contexts exchange
//! - `ClientLog` and `SyncNode` - External log and network collaborators

pub mod channel;
pub mod clock;
pub mod context;
pub mod keys;
pub mod log;
pub mod node;
pub mod protocol;
pub mod report;

pub use channel::{ChannelError, ChannelEvent, ChannelSubscription, MemoryChannel, SharedChannel, TabChannel};
pub use clock::{Clock, InstantClock, SystemClock};
pub use context::ContextId;
pub use keys::{KeySpace, Topic};
pub use log::{Action, ClientLog, Cursor, Entry, MemoryLog, Meta, MetaIds};
pub use node::{LoopbackNode, NodeEvent, SyncNode};
pub use protocol::{
    ConnectionState, Incoming, LeaderRecord, LogMutation, MutationKind, ProtocolError, encode_state,
    encode_subprotocol, encode_user,
};
pub use report::ErrorReport;
