//! # Real-Time Feed Client
//!
//! Keeps subscribed tables current with server-originated changes.
//!
//! ## Connection lifecycle
//!
//! ```text
//! idle ──first subscribe──▶ connecting ──ok──▶ connected
//!                              ▲    │              │
//!                              │   err           drop
//!                              │    ▼              ▼
//!                              └── backoff ◀───────┘
//! ```
//!
//! The connection task starts with the first subscription and runs until
//! [`RealtimeFeed::shutdown`]. After every (re)connect all active
//! subscriptions are sent again. Reconnect delays follow the transport's
//! [`RetryPolicy`] and never give up.
//!
//! ## Ordering
//!
//! Events carry a per-table `sequence`; events at or below the last applied
//! sequence of their table are discarded. Record events for records with a
//! pending local operation are deferred through [`SyncState`].

use bridge_traits::{PushConnection, PushConnector, RetryPolicy};
use core_auth::CredentialManager;
use core_runtime::events::{CoreEvent, EventBus, FeedEvent};
use provider_records::TableRef;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::protocol::{ControlMessage, FeedEventType, FeedMessage};
use crate::state::{ApplyOutcome, SyncState};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(TableRef),
    Unsubscribe(TableRef),
}

struct FeedInner {
    connector: Arc<dyn PushConnector>,
    credentials: CredentialManager,
    state: Arc<SyncState>,
    event_bus: EventBus,
    config: FeedConfig,
    subscriptions: Mutex<BTreeSet<TableRef>>,
    /// Present once the connection task runs
    commands: Mutex<Option<mpsc::UnboundedSender<FeedCommand>>>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Handle on the real-time feed. Clones share one connection.
#[derive(Clone)]
pub struct RealtimeFeed {
    inner: Arc<FeedInner>,
}

impl RealtimeFeed {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        credentials: CredentialManager,
        state: Arc<SyncState>,
        config: FeedConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let event_bus = state.event_bus().clone();
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(FeedInner {
                connector,
                credentials,
                state,
                event_bus,
                config,
                subscriptions: Mutex::new(BTreeSet::new()),
                commands: Mutex::new(None),
                connected,
                shutdown,
            }),
        }
    }

    /// Subscribe to a table, connecting on first use.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn subscribe(&self, table: &TableRef) -> Result<()> {
        if !table.is_valid() {
            return Err(SyncError::InvalidTable(table.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let inserted = self.inner.subscriptions.lock().await.insert(table.clone());
        if !inserted {
            return Ok(());
        }

        let mut commands = self.inner.commands.lock().await;
        match commands.as_ref() {
            Some(sender) => {
                let _ = sender.send(FeedCommand::Subscribe(table.clone()));
            }
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                *commands = Some(sender);
                info!("Starting real-time feed connection");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.run(receiver).await });
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(table = %table))]
    pub async fn unsubscribe(&self, table: &TableRef) -> Result<()> {
        let removed = self.inner.subscriptions.lock().await.remove(table);
        if removed {
            if let Some(sender) = self.inner.commands.lock().await.as_ref() {
                let _ = sender.send(FeedCommand::Unsubscribe(table.clone()));
            }
        }
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<TableRef> {
        self.inner.subscriptions.lock().await.iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Stop the connection task and any pending reconnect timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl FeedInner {
    fn emit(&self, event: FeedEvent) {
        let _ = self.event_bus.emit(CoreEvent::Feed(event));
    }

    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|e| SyncError::Feed(e.to_string()))?;
        self.connector
            .connect(&self.config.url, &token)
            .await
            .map_err(|e| SyncError::Feed(e.to_string()))
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        let mut attempt = 0u32;

        loop {
            let connection = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.connect() => result,
            };

            match connection {
                Ok(mut connection) => {
                    // Anything queued while disconnected is covered by the resubscribe
                    while commands.try_recv().is_ok() {}

                    match self.resubscribe(connection.as_mut()).await {
                        Ok(count) => {
                            attempt = 0;
                            self.connected.send_replace(true);
                            info!(subscriptions = count, "Feed connected");
                            self.emit(FeedEvent::Connected {
                                subscriptions: count,
                            });

                            let reason = self.pump(connection.as_mut(), &mut commands).await;
                            self.connected.send_replace(false);

                            match reason {
                                Some(reason) => {
                                    warn!(reason = %reason, "Feed disconnected");
                                    self.emit(FeedEvent::Disconnected { reason });
                                }
                                None => {
                                    let _ = connection.close().await;
                                    self.emit(FeedEvent::Disconnected {
                                        reason: "shutdown".to_string(),
                                    });
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Feed resubscribe failed: {}", e);
                            self.emit(FeedEvent::Disconnected {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => warn!("Feed connection failed: {}", e),
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Feed reconnect scheduled");
            self.emit(FeedEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn resubscribe(&self, connection: &mut dyn PushConnection) -> Result<usize> {
        let tables: Vec<TableRef> = self.subscriptions.lock().await.iter().cloned().collect();
        for table in &tables {
            let message = ControlMessage::Subscribe {
                table: table.clone(),
            }
            .to_json()?;
            connection
                .send(message)
                .await
                .map_err(|e| SyncError::Feed(e.to_string()))?;
        }
        Ok(tables.len())
    }

    /// Forward commands and apply messages until the connection drops
    /// (`Some(reason)`) or the feed shuts down (`None`).
    async fn pump(
        &self,
        connection: &mut dyn PushConnection,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                command = commands.recv() => {
                    let message = match command {
                        Some(FeedCommand::Subscribe(table)) => ControlMessage::Subscribe { table },
                        Some(FeedCommand::Unsubscribe(table)) => ControlMessage::Unsubscribe { table },
                        None => return None,
                    };
                    let sent = match message.to_json() {
                        Ok(json) => connection.send(json).await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    if let Err(reason) = sent {
                        return Some(reason);
                    }
                }
                message = connection.next_message() => match message {
                    Some(Ok(text)) => {
                        if let Err(e) = self.handle_message(&text).await {
                            warn!("Dropping feed message: {}", e);
                        }
                    }
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return Some("connection closed".to_string()),
                },
            }
        }
    }

    async fn handle_message(&self, text: &str) -> Result<()> {
        let message = FeedMessage::parse(text)?;

        match message.event_type {
            FeedEventType::Unknown => {
                debug!("Ignoring unknown feed event");
                Ok(())
            }
            FeedEventType::TableUpdated | FeedEventType::BaseUpdated => {
                self.handle_schema_change(&message).await
            }
            _ => {
                let Some(change) = message.to_change()? else {
                    return Ok(());
                };
                if !self.subscriptions.lock().await.contains(&change.table) {
                    debug!(table = %change.table, "Ignoring event for unsubscribed table");
                    return Ok(());
                }

                let mut guard = self.state.lock().await;
                if !guard.accept_sequence(&change.table, change.sequence).await? {
                    debug!(
                        table = %change.table,
                        sequence = change.sequence,
                        "Discarding duplicate or out-of-order feed event"
                    );
                    return Ok(());
                }
                let sequence = change.sequence;
                let outcome = guard.apply_remote_change(change).await?;
                if outcome != ApplyOutcome::Applied {
                    debug!(sequence, outcome = ?outcome, "Feed event not applied");
                }
                Ok(())
            }
        }
    }

    async fn handle_schema_change(&self, message: &FeedMessage) -> Result<()> {
        let base_id = message.table_ref.base_id.clone();
        let table_id = message.table_ref.table_id.clone();

        let mut guard = self.state.lock().await;
        let affected: Vec<TableRef> = match message.table_ref.table() {
            Some(table) => {
                if !guard.accept_sequence(&table, message.sequence).await? {
                    return Ok(());
                }
                vec![table]
            }
            None => guard
                .cached_tables()
                .into_iter()
                .filter(|table| table.base_id == base_id)
                .collect(),
        };
        for table in &affected {
            guard.mark_stale(table).await?;
        }
        drop(guard);

        info!(base_id = %base_id, tables = affected.len(), "Remote schema changed");
        self.emit(FeedEvent::SchemaChanged { base_id, table_id });
        Ok(())
    }
}
