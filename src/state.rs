use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::types::{AdapterPowerState, Connection, Notice};

/// Snapshot of the process-wide connection state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// The single active connection, if any
    pub active_peripheral: Option<Connection>,
    /// Last known adapter power state
    pub power: AdapterPowerState,
}

impl ConnectionState {
    /// Whether commands and polling are allowed
    #[must_use]
    pub const fn can_command(&self) -> bool {
        self.active_peripheral.is_some() && self.power.is_powered_on()
    }
}

/// Shared holder of the connected peripheral and adapter power state
///
/// Each update is applied as a whole, so readers never observe a connection
/// without its matching power state.
#[derive(Debug, Clone)]
pub struct SharedState {
    sender: Arc<watch::Sender<ConnectionState>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Create an empty state: nothing connected, power unknown
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.sender.borrow().clone()
    }

    /// Currently connected peripheral
    #[must_use]
    pub fn active_connection(&self) -> Option<Connection> {
        self.sender.borrow().active_peripheral.clone()
    }

    /// Last known adapter power state
    #[must_use]
    pub fn power_state(&self) -> AdapterPowerState {
        self.sender.borrow().power
    }

    /// Observe every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Record a power state reported by the adapter
    pub fn set_power_state(&self, power: AdapterPowerState) {
        self.sender.send_if_modified(|state| {
            if state.power == power {
                return false;
            }
            debug!(from = %state.power, to = %power, "adapter power state changed");
            state.power = power;
            true
        });
    }

    /// Publish a fully established connection; the adapter is known to be on
    pub fn publish_connection(&self, connection: Connection) {
        info!(peripheral = %connection.id(), "connection published");
        self.sender.send_modify(|state| {
            state.active_peripheral = Some(connection);
            state.power = AdapterPowerState::PoweredOn;
        });
    }

    /// Drop the active connection and record the resulting power state
    ///
    /// Returns the connection that was active.
    pub fn clear_connection(&self, power: AdapterPowerState) -> Option<Connection> {
        let mut previous = None;
        self.sender.send_modify(|state| {
            previous = state.active_peripheral.take();
            state.power = power;
        });
        if let Some(connection) = &previous {
            info!(peripheral = %connection.id(), "connection cleared");
        }
        previous
    }
}

/// Broadcast bus for user-facing notices
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
}

impl Notifier {
    /// Create a bus buffering up to `capacity` notices per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive notices published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    /// Publish a notice; having no listener is fine
    pub fn publish(&self, notice: Notice) {
        debug!(%notice, "notice");
        let _ = self.sender.send(notice);
    }
}
