//! Process-wide connection state.
//!
//! Only classified request outcomes move the state: a network-class failure
//! marks the client Offline, any received response marks it Online.

use core_runtime::events::{ConnectionEvent, CoreEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Shared handle on the connection state.
///
/// Cloning is cheap; all clones observe and drive the same state.
#[derive(Clone)]
pub struct ConnectionMonitor {
    sender: Arc<watch::Sender<ConnectionState>>,
    event_bus: Option<EventBus>,
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
            event_bus: None,
        }
    }

    /// Emit `Connection` events on the bus for every transition.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    pub fn mark_online(&self) {
        if self.transition(ConnectionState::Online) {
            info!("Connection state changed to Online");
            self.emit(ConnectionEvent::Online);
        }
    }

    pub fn mark_offline(&self, reason: impl Into<String>) {
        if self.transition(ConnectionState::Offline) {
            let reason = reason.into();
            warn!(reason = %reason, "Connection state changed to Offline");
            self.emit(ConnectionEvent::Offline { reason });
        }
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.sender.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Connection(event));
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(ConnectionState::Online)
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("state", &self.state())
            .finish()
    }
}
