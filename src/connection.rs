use futures::FutureExt;
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{
    discovery::DiscoverySession,
    error::{ReabilitaError, Result},
    state::{Notifier, SharedState},
    transport::Transport,
    types::{AdapterPowerState, Connection, Notice, PeripheralHandle, SessionConfig},
};

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    state: SharedState,
    discovery: DiscoverySession,
    notifier: Notifier,
    config: SessionConfig,
    connecting: Mutex<()>,
    // Connection ids with a disconnect handler in place
    observers: Mutex<HashSet<String>>,
}

/// Establishes the single link and tears the session down when it drops
///
/// A connection is only published once the link is open and the expected
/// service is resolved. Exactly one disconnect handler is registered per link.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<ConnectionInner>,
}

impl ConnectionSession {
    /// Create a session bound to the shared state and the discovery session it resets
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        state: SharedState,
        discovery: DiscoverySession,
        notifier: Notifier,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                state,
                discovery,
                notifier,
                config,
                connecting: Mutex::new(()),
                observers: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// The active connection, if any
    #[must_use]
    pub fn active(&self) -> Option<Connection> {
        self.inner.state.active_connection()
    }

    /// Connect to a scanned peripheral
    ///
    /// Returns `false` without touching the link when a peripheral is already
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns the connect, discovery or disconnect registration error; the
    /// link is closed, the shared state is left as it was and a
    /// [`Notice::ConnectFailed`] is published.
    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<bool> {
        let _guard = self.inner.connecting.lock().await;

        if let Some(active) = self.inner.state.active_connection() {
            debug!(active = %active.id(), requested = %peripheral.id, "already connected");
            return Ok(false);
        }

        info!(peripheral = %peripheral.id, "connecting");
        let connection = match self.open(peripheral).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(peripheral = %peripheral.id, error = %e, "connection failed");
                self.inner
                    .notifier
                    .publish(Notice::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        self.inner.state.publish_connection(connection.clone());

        // The handler drops a loss it sees before publication as stale
        if !self.inner.observers.lock().await.contains(connection.id()) {
            warn!(peripheral = %connection.id(), "link lost while connecting");
            handle_disconnect(&self.inner, connection).await;
            return Ok(true);
        }

        info!(peripheral = %connection.id(), "connected");
        Ok(true)
    }

    /// Tear down the active link
    ///
    /// The disconnect handler performs the cleanup. If the transport reports
    /// the link already gone, cleanup runs here instead.
    ///
    /// # Errors
    ///
    /// Returns [`ReabilitaError::NotConnected`] when nothing is connected.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self
            .inner
            .state
            .active_connection()
            .ok_or(ReabilitaError::NotConnected)?;

        info!(peripheral = %connection.id(), "disconnecting");
        if let Err(e) = self.inner.transport.disconnect(&connection).await {
            warn!(peripheral = %connection.id(), error = %e, "disconnect failed, cleaning up locally");
            handle_disconnect(&self.inner, connection).await;
        }
        Ok(())
    }

    /// Reset the session after the adapter was switched off
    ///
    /// The connection is cleared before the link is closed, so the disconnect
    /// handler sees a stale link and raises no second notice.
    pub async fn power_lost(&self) {
        if let Some(connection) = self
            .inner
            .state
            .clear_connection(AdapterPowerState::PoweredOff)
        {
            if let Err(e) = self.inner.transport.disconnect(&connection).await {
                debug!(peripheral = %connection.id(), error = %e, "closing link after power off");
            }
        }
        self.inner.discovery.reset().await;
    }

    async fn open(&self, peripheral: &PeripheralHandle) -> Result<Connection> {
        let limit = self.inner.config.connect_timeout();
        let connection = timeout(limit, self.inner.transport.connect(peripheral))
            .await
            .map_err(|_| ReabilitaError::Timeout {
                timeout_ms: self.inner.config.connect_timeout_ms,
            })??;

        let ready = match self.inner.transport.discover_capabilities(&connection).await {
            Ok(()) => self.observe(&connection).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            if let Err(close) = self.inner.transport.disconnect(&connection).await {
                debug!(error = %close, "closing half-open link");
            }
            return Err(e);
        }
        Ok(connection)
    }

    async fn observe(&self, connection: &Connection) -> Result<()> {
        {
            let mut observers = self.inner.observers.lock().await;
            if !observers.insert(connection.id().to_string()) {
                debug!(peripheral = %connection.id(), "disconnect handler already registered");
                return Ok(());
            }
        }

        let inner = Arc::downgrade(&self.inner);
        let handler = Box::new(move |lost: Connection| on_link_lost(inner, lost).boxed());

        match self.inner.transport.on_disconnect(connection, handler).await {
            Ok(true) => {
                debug!(peripheral = %connection.id(), "disconnect handler registered");
                Ok(())
            }
            Ok(false) => {
                debug!(peripheral = %connection.id(), "transport kept the earlier handler");
                Ok(())
            }
            Err(e) => {
                warn!(peripheral = %connection.id(), error = %e, "disconnect handler not registered");
                self.inner.observers.lock().await.remove(connection.id());
                Err(e)
            }
        }
    }
}

async fn on_link_lost(inner: Weak<ConnectionInner>, connection: Connection) {
    if let Some(inner) = inner.upgrade() {
        handle_disconnect(&inner, connection).await;
    }
}

async fn handle_disconnect(inner: &ConnectionInner, connection: Connection) {
    warn!(peripheral = %connection.id(), "peripheral disconnected");
    inner.observers.lock().await.remove(connection.id());

    if inner.state.active_connection().as_ref() != Some(&connection) {
        debug!(peripheral = %connection.id(), "stale disconnect ignored");
        return;
    }

    inner.state.clear_connection(AdapterPowerState::Unknown);
    inner.discovery.reset().await;
    inner.notifier.publish(Notice::Disconnected {
        peripheral: connection.peripheral.display_name().to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discovery::ScanPhase,
        mock::{MockOperation, MockTransport},
        PERIPHERAL_NAME,
    };
    use std::time::Duration;

    struct Harness {
        transport: Arc<MockTransport>,
        state: SharedState,
        discovery: DiscoverySession,
        notifier: Notifier,
        session: ConnectionSession,
    }

    impl Harness {
        fn new() -> Self {
            let transport = Arc::new(MockTransport::powered_on());
            let state = SharedState::new();
            let notifier = Notifier::new(8);
            let config = SessionConfig::default();
            let discovery = DiscoverySession::new(
                transport.clone(),
                state.clone(),
                notifier.clone(),
                config.clone(),
            );
            let session = ConnectionSession::new(
                transport.clone(),
                state.clone(),
                discovery.clone(),
                notifier.clone(),
                config,
            );
            Self {
                transport,
                state,
                discovery,
                notifier,
                session,
            }
        }
    }

    fn handle(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id, Some(PERIPHERAL_NAME.to_string()))
    }

    #[tokio::test]
    async fn test_connect_publishes_connection() {
        let h = Harness::new();

        assert!(h.session.connect(&handle("A")).await.unwrap());

        let snapshot = h.state.snapshot();
        assert_eq!(snapshot.active_peripheral.unwrap().id(), "A");
        assert_eq!(snapshot.power, AdapterPowerState::PoweredOn);
        assert_eq!(h.transport.handler_registrations(), 1);
    }

    #[tokio::test]
    async fn test_second_connect_is_a_no_op() {
        let h = Harness::new();
        h.session.connect(&handle("A")).await.unwrap();

        assert!(!h.session.connect(&handle("B")).await.unwrap());

        assert_eq!(h.session.active().unwrap().id(), "A");
        assert!(!h.transport.is_connected("B"));
        assert_eq!(h.transport.handler_registrations(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_state_untouched() {
        let h = Harness::new();
        h.transport.set_failing(MockOperation::Connect, true);
        let mut notices = h.notifier.subscribe();

        let result = h.session.connect(&handle("A")).await;

        assert!(matches!(result, Err(ReabilitaError::ConnectFailed(_))));
        assert_eq!(h.state.active_connection(), None);
        assert_eq!(h.state.power_state(), AdapterPowerState::Unknown);
        assert!(matches!(notices.recv().await.unwrap(), Notice::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_discovery_failure_closes_half_open_link() {
        let h = Harness::new();
        h.transport.set_failing(MockOperation::Discover, true);

        let result = h.session.connect(&handle("A")).await;

        assert!(matches!(result, Err(ReabilitaError::Discovery(_))));
        assert_eq!(h.state.active_connection(), None);
        assert!(!h.transport.is_connected("A"));
        assert_eq!(h.transport.handler_registrations(), 0);
    }

    #[tokio::test]
    async fn test_unwatchable_link_is_never_published() {
        let h = Harness::new();
        h.transport.set_failing(MockOperation::DisconnectWatch, true);
        let mut notices = h.notifier.subscribe();

        let result = h.session.connect(&handle("A")).await;

        assert!(matches!(result, Err(ReabilitaError::Ble(_))));
        assert_eq!(h.state.active_connection(), None);
        assert!(!h.transport.is_connected("A"));
        assert!(matches!(notices.recv().await.unwrap(), Notice::ConnectFailed(_)));

        h.transport.set_failing(MockOperation::DisconnectWatch, false);
        assert!(h.session.connect(&handle("A")).await.unwrap());
        assert_eq!(h.transport.handler_registrations(), 1);

        h.transport.drop_link("A").await;
        assert_eq!(h.state.active_connection(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_while_registering_is_cleaned_up() {
        let h = Harness::new();
        let mut notices = h.notifier.subscribe();
        h.transport.pause(MockOperation::DisconnectWatch);

        let session = h.session.clone();
        let pending = tokio::spawn(async move { session.connect(&handle("A")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.transport.drop_link("A").await;
        h.transport.resume(MockOperation::DisconnectWatch);

        assert!(pending.await.unwrap().unwrap());
        assert_eq!(h.state.active_connection(), None);
        assert_eq!(h.state.power_state(), AdapterPowerState::Unknown);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::Disconnected {
                peripheral: PERIPHERAL_NAME.to_string()
            }
        );

        assert!(h.session.connect(&handle("A")).await.unwrap());
        assert_eq!(h.session.active().unwrap().id(), "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_resets_session() {
        let h = Harness::new();
        let mut notices = h.notifier.subscribe();

        h.discovery.start_scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        h.transport.advertise(handle("A"));
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(h.discovery.results().await.len(), 1);

        h.session.connect(&handle("A")).await.unwrap();
        h.transport.drop_link("A").await;

        let snapshot = h.state.snapshot();
        assert_eq!(snapshot.active_peripheral, None);
        assert_eq!(snapshot.power, AdapterPowerState::Unknown);
        assert!(h.discovery.results().await.is_empty());
        assert_eq!(h.discovery.phase().await, ScanPhase::Idle);
        assert!(!h.discovery.has_scanned_once().await);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::Disconnected {
                peripheral: PERIPHERAL_NAME.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reconnect_registers_a_fresh_handler() {
        let h = Harness::new();
        h.session.connect(&handle("A")).await.unwrap();
        h.transport.drop_link("A").await;

        assert!(h.session.connect(&handle("A")).await.unwrap());

        assert_eq!(h.transport.handler_registrations(), 2);
        h.transport.drop_link("A").await;
        assert_eq!(h.state.active_connection(), None);
    }

    #[tokio::test]
    async fn test_power_lost_clears_without_disconnect_notice() {
        let h = Harness::new();
        h.session.connect(&handle("A")).await.unwrap();
        let mut notices = h.notifier.subscribe();

        h.session.power_lost().await;

        let snapshot = h.state.snapshot();
        assert_eq!(snapshot.active_peripheral, None);
        assert_eq!(snapshot.power, AdapterPowerState::PoweredOff);
        assert!(!h.transport.is_connected("A"));
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_disconnect() {
        let h = Harness::new();
        assert!(matches!(
            h.session.disconnect().await,
            Err(ReabilitaError::NotConnected)
        ));

        h.session.connect(&handle("A")).await.unwrap();
        h.session.disconnect().await.unwrap();

        assert_eq!(h.state.active_connection(), None);
        assert!(!h.transport.is_connected("A"));
    }
}
