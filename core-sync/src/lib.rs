//! # Sync Engine
//!
//! Offline-first record synchronization against a remote table API.
//!
//! ## Overview
//!
//! Local reads are served from a persisted per-table cache. Local writes are
//! applied optimistically and recorded in a durable pending-operation log
//! that drains to the server whenever the connection is up. A push feed keeps
//! subscribed tables current with changes made elsewhere.
//!
//! ## Components
//!
//! - **Sync State** (`state`): cache, pending log, id aliases and feed
//!   sequences behind one lock, mirrored to the local store (`store`)
//! - **Mutation Queue** (`queue`): optimistic writes, ordered per-table
//!   delivery, temporary id remapping and the attempt budget
//! - **Real-Time Feed** (`feed`): lazy connection, subscriptions,
//!   reconnects and ordered application of remote changes
//! - **Feed Protocol** (`protocol`): wire messages of the push feed

pub mod error;
pub mod feed;
pub mod protocol;
pub mod queue;
pub mod state;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{Result, SyncError};
pub use feed::{FeedConfig, RealtimeFeed};
pub use protocol::{ControlMessage, FeedEventType, FeedMessage};
pub use queue::{MutationQueue, QueueConfig};
pub use state::{ApplyOutcome, RemoteChange, RemoteChangeKind, StateGuard, SyncState};
pub use store::{PersistedState, SyncStore};
pub use types::{
    is_temp_id, new_temp_id, CacheEntry, FailedOperation, IdAlias, OperationId, OperationKind,
    OperationStatus, PendingOperation, SyncResult, TableMeta, TEMP_ID_PREFIX,
};
