//! # Event Bus System
//!
//! Typed lifecycle events for the sync engine, published over
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: one enum per component, wrapped by [`CoreEvent`]
//! - **EventBus**: central broadcast channel for publishing events
//! - **EventStream**: wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │  Transport   ├────────────>│           │
//! └──────────────┘             │           │
//! ┌──────────────┐    emit     │ EventBus  │   subscribe   ┌─────────────┐
//! │ Mutation Q.  ├────────────>│ (broadcast├──────────────>│ Application │
//! └──────────────┘             │  channel) │               └─────────────┘
//! ┌──────────────┐    emit     │           │
//! │ Feed client  ├────────────>│           │
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Event Types
//!
//! | Application-facing name | Variant |
//! |-------------------------|---------|
//! | `online` / `offline` | [`ConnectionEvent::Online`] / [`ConnectionEvent::Offline`] |
//! | `syncStart` | [`SyncEvent::Started`] |
//! | `syncComplete` | [`SyncEvent::Completed`] |
//! | `syncError` | [`SyncEvent::Error`] |
//! | `record:created` / `record:updated` / `record:deleted` | [`RecordEvent`] |
//!
//! Feed connection and credential refresh events are published as well.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{ConnectionEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus.emit(CoreEvent::Connection(ConnectionEvent::Online)).ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Connection restored");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error that publishers ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Connectivity transitions
    Connection(ConnectionEvent),
    /// Drain pass lifecycle
    Sync(SyncEvent),
    /// Cached record changes
    Record(RecordEvent),
    /// Real-time feed connection lifecycle
    Feed(FeedEvent),
    /// Credential refresh
    Auth(AuthEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Connection(e) => e.description(),
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Record(e) => e.description(),
            CoreEvent::Feed(e) => e.description(),
            CoreEvent::Auth(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Error { .. }) => EventSeverity::Error,
            CoreEvent::Auth(AuthEvent::RefreshFailed { .. }) => EventSeverity::Error,
            CoreEvent::Connection(ConnectionEvent::Offline { .. }) => EventSeverity::Warning,
            CoreEvent::Feed(FeedEvent::Disconnected { .. }) => EventSeverity::Warning,
            CoreEvent::Connection(ConnectionEvent::Online) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Connection Events
// ============================================================================

/// ConnectionState transitions, driven by classified request outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectionEvent {
    /// A request succeeded after the engine considered itself offline.
    Online,
    /// A request failed with a network-class error.
    Offline {
        /// The failure that flipped the state.
        reason: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> &str {
        match self {
            ConnectionEvent::Online => "Connection restored",
            ConnectionEvent::Offline { .. } => "Connection lost",
        }
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Why a pending operation was dropped without being applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The remote API rejected the operation with a non-retryable error.
    Rejected,
    /// The operation used up its total attempt budget.
    RetriesExhausted,
    /// The operation stayed queued longer than the configured maximum age.
    Expired,
    /// An earlier Create this operation depended on was dropped.
    DependencyDropped,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Rejected => "rejected",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::Expired => "expired",
            DropReason::DependencyDropped => "dependency_dropped",
        }
    }
}

/// An operation that did not succeed during a drain pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedOperation {
    pub op_id: String,
    pub error: String,
    /// `true` if the operation was dropped, `false` if it stays queued.
    pub permanent: bool,
}

/// Drain pass lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A drain pass started.
    Started {
        /// Tables (`baseId/tableId`) with pending work.
        tables: Vec<String>,
        /// Pending operations across those tables.
        pending: u64,
    },
    /// A drain pass finished.
    Completed {
        /// Operations applied to the remote store.
        applied: Vec<String>,
        /// Operations that failed during the pass.
        failed: Vec<FailedOperation>,
        /// Operations still queued after the pass.
        remaining: u64,
        duration_ms: u64,
    },
    /// A queued operation was permanently dropped.
    Error {
        op_id: String,
        /// `baseId/tableId`
        table: String,
        /// `create`, `update` or `delete`
        kind: String,
        target_id: Option<String>,
        /// The payload the application originally submitted.
        payload: Option<serde_json::Value>,
        reason: DropReason,
        message: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Completed { .. } => "Sync completed",
            SyncEvent::Error { .. } => "Pending operation dropped",
        }
    }
}

// ============================================================================
// Record Events
// ============================================================================

/// Who caused a cached record change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// An optimistic write by this client or the server's answer to it.
    Local,
    /// A change pushed by the real-time feed.
    Remote,
}

/// Changes to the cached record set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum RecordEvent {
    Created {
        table: String,
        record_id: String,
        source: ChangeSource,
    },
    Updated {
        table: String,
        record_id: String,
        source: ChangeSource,
    },
    Deleted {
        table: String,
        record_id: String,
        source: ChangeSource,
    },
    /// A temporary id was replaced by the server-assigned id.
    IdRemapped {
        table: String,
        temp_id: String,
        server_id: String,
    },
}

impl RecordEvent {
    fn description(&self) -> &str {
        match self {
            RecordEvent::Created { .. } => "Record created",
            RecordEvent::Updated { .. } => "Record updated",
            RecordEvent::Deleted { .. } => "Record deleted",
            RecordEvent::IdRemapped { .. } => "Temporary record id remapped",
        }
    }
}

// ============================================================================
// Feed Events
// ============================================================================

/// Real-time feed connection lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FeedEvent {
    Connected {
        /// Tables re-subscribed on this connection.
        subscriptions: usize,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    /// Table or base schema changed remotely; cached entries are stale.
    SchemaChanged {
        base_id: String,
        table_id: Option<String>,
    },
}

impl FeedEvent {
    fn description(&self) -> &str {
        match self {
            FeedEvent::Connected { .. } => "Feed connected",
            FeedEvent::Disconnected { .. } => "Feed disconnected",
            FeedEvent::Reconnecting { .. } => "Feed reconnecting",
            FeedEvent::SchemaChanged { .. } => "Remote schema changed",
        }
    }
}

// ============================================================================
// Authentication Events
// ============================================================================

/// Credential refresh events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A credential refresh started.
    TokenRefreshing,
    /// A credential refresh completed.
    TokenRefreshed {
        /// Unix timestamp (seconds) when the new credential expires, if known.
        expires_at: Option<i64>,
    },
    /// The credential source failed to refresh.
    RefreshFailed {
        message: String,
    },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::TokenRefreshing => "Refreshing credential",
            AuthEvent::TokenRefreshed { .. } => "Credential refreshed",
            AuthEvent::RefreshFailed { .. } => "Credential refresh failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let sync_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Sync(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
