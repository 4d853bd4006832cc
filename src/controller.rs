use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::{
    sync::{broadcast, watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    ble::BtleTransport,
    connection::ConnectionSession,
    discovery::DiscoverySession,
    error::Result,
    protocol::Command,
    reconciler::Reconciler,
    state::{ConnectionState, Notifier, SharedState},
    transport::Transport,
    types::{
        AdapterPowerState, ControlParameters, Notice, Parameter, PeripheralHandle, SessionConfig,
    },
};

/// Everything the presentation layer needs to drive the peripheral
///
/// `DeviceController` wires the discovery, connection and reconciler sessions
/// to one transport and keeps them consistent with the adapter power state.
///
/// # Examples
///
/// ```no_run
/// use reabilita::{DeviceController, SessionConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let controller = DeviceController::with_bluetooth(SessionConfig::default()).await?;
///
///     controller.start_scan().await?;
///     tokio::time::sleep(Duration::from_secs(6)).await;
///
///     if let Some(peripheral) = controller.discovery_results().await.first() {
///         controller.connect_to(peripheral).await?;
///         controller.set_speed(3).await;
///         controller.toggle().await?;
///     }
///
///     controller.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct DeviceController {
    state: SharedState,
    notifier: Notifier,
    discovery: DiscoverySession,
    connection: ConnectionSession,
    reconciler: Reconciler,
    params: Arc<RwLock<ControlParameters>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceController {
    /// Build the sessions on top of `transport` and start following the adapter
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the power state stream cannot be opened.
    pub async fn start(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        let state = SharedState::new();
        let notifier = Notifier::new(config.notice_capacity);
        let discovery = DiscoverySession::new(
            transport.clone(),
            state.clone(),
            notifier.clone(),
            config.clone(),
        );
        let connection = ConnectionSession::new(
            transport.clone(),
            state.clone(),
            discovery.clone(),
            notifier.clone(),
            config.clone(),
        );
        let reconciler = Reconciler::new(transport.clone(), state.clone(), notifier.clone(), &config);

        let power_states = transport.power_states().await?;
        let tasks = vec![
            tokio::spawn(monitor_power(
                power_states,
                state.clone(),
                connection.clone(),
                notifier.clone(),
            )),
            reconciler.spawn_supervisor(),
        ];

        info!("device controller started");
        Ok(Self {
            state,
            notifier,
            discovery,
            connection,
            reconciler,
            params: Arc::new(RwLock::new(ControlParameters::default())),
            tasks,
        })
    }

    /// Start on the first Bluetooth adapter of this machine
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReabilitaError::AdapterUnavailable`] when no adapter is
    /// present, or the underlying Bluetooth error.
    pub async fn with_bluetooth(config: SessionConfig) -> Result<Self> {
        let transport = BtleTransport::new().await?;
        Self::start(Arc::new(transport), config).await
    }

    /// Connected peripheral, if any
    #[must_use]
    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.state
            .active_connection()
            .map(|connection| connection.peripheral)
    }

    /// Last known adapter power state
    #[must_use]
    pub fn adapter_power_state(&self) -> AdapterPowerState {
        self.state.power_state()
    }

    /// Observe connection and power changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Peripherals found by the last scan
    pub async fn discovery_results(&self) -> Vec<PeripheralHandle> {
        self.discovery.results().await
    }

    /// Whether a scan is in progress
    pub async fn is_scanning(&self) -> bool {
        self.discovery.is_scanning().await
    }

    /// Whether a scan completed since the last reset
    pub async fn has_scanned_once(&self) -> bool {
        self.discovery.has_scanned_once().await
    }

    /// Whether the peripheral is believed to be running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.reconciler.is_running()
    }

    /// Observe the running flag
    #[must_use]
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.reconciler.subscribe_running()
    }

    /// Alerts for the user
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    /// Parameters used by the next start command
    pub async fn parameters(&self) -> ControlParameters {
        *self.params.read().await
    }

    /// Whether the parameters can be changed right now
    ///
    /// They are locked while the peripheral runs and while nothing is connected.
    #[must_use]
    pub fn parameters_editable(&self) -> bool {
        self.state.active_connection().is_some() && !self.reconciler.is_running()
    }

    /// Scan for the peripheral
    ///
    /// # Errors
    ///
    /// See [`DiscoverySession::start_scan`].
    pub async fn start_scan(&self) -> Result<bool> {
        self.discovery.start_scan().await
    }

    /// Connect to a peripheral from the scan results
    ///
    /// # Errors
    ///
    /// See [`ConnectionSession::connect`].
    pub async fn connect_to(&self, peripheral: &PeripheralHandle) -> Result<bool> {
        self.connection.connect(peripheral).await
    }

    /// Disconnect from the active peripheral
    ///
    /// # Errors
    ///
    /// See [`ConnectionSession::disconnect`].
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Start the peripheral with the current parameters, or stop it
    ///
    /// # Errors
    ///
    /// See [`Reconciler::toggle`].
    pub async fn toggle(&self) -> Result<Option<Command>> {
        let params = self.parameters().await;
        self.reconciler.toggle(params).await
    }

    /// Set a parameter, clamped to its range
    ///
    /// Returns the stored value, or `None` when parameters are locked.
    pub async fn set_parameter(&self, parameter: Parameter, value: u8) -> Option<u8> {
        self.edit(parameter, |params| params.set(parameter, value)).await
    }

    /// Raise a parameter by one, stopping at its maximum
    pub async fn increment(&self, parameter: Parameter) -> Option<u8> {
        self.edit(parameter, |params| params.increment(parameter)).await
    }

    /// Lower a parameter by one, stopping at its minimum
    pub async fn decrement(&self, parameter: Parameter) -> Option<u8> {
        self.edit(parameter, |params| params.decrement(parameter)).await
    }

    /// Set the speed
    pub async fn set_speed(&self, value: u8) -> Option<u8> {
        self.set_parameter(Parameter::Speed, value).await
    }

    /// Set the intensity
    pub async fn set_intensity(&self, value: u8) -> Option<u8> {
        self.set_parameter(Parameter::Intensity, value).await
    }

    /// Set the repetitions
    pub async fn set_repetitions(&self, value: u8) -> Option<u8> {
        self.set_parameter(Parameter::Repetitions, value).await
    }

    async fn edit<F>(&self, parameter: Parameter, change: F) -> Option<u8>
    where
        F: FnOnce(&mut ControlParameters) -> u8,
    {
        if !self.parameters_editable() {
            debug!(%parameter, "parameter change ignored");
            return None;
        }
        let value = change(&mut *self.params.write().await);
        debug!(%parameter, value, "parameter changed");
        Some(value)
    }

    /// Disconnect and stop all background tasks
    pub async fn shutdown(mut self) {
        if self.state.active_connection().is_some() {
            if let Err(e) = self.connection.disconnect().await {
                warn!(error = %e, "disconnect during shutdown failed");
            }
        }
        self.discovery.reset().await;
        self.reconciler.detach().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("device controller stopped");
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn monitor_power(
    mut states: BoxStream<'static, AdapterPowerState>,
    state: SharedState,
    connection: ConnectionSession,
    notifier: Notifier,
) {
    while let Some(power) = states.next().await {
        if power == AdapterPowerState::PoweredOff {
            let already_off = state.power_state() == AdapterPowerState::PoweredOff;
            connection.power_lost().await;
            if !already_off {
                warn!("adapter powered off");
                notifier.publish(Notice::AdapterPoweredOff);
            }
        } else {
            state.set_power_state(power);
        }
    }
    debug!("power state stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::ScanPhase, mock::MockTransport, PERIPHERAL_NAME};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn reabilita(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id, Some(PERIPHERAL_NAME.to_string()))
    }

    async fn controller() -> (Arc<MockTransport>, DeviceController) {
        let transport = Arc::new(MockTransport::powered_on());
        let controller = assert_ok!(
            DeviceController::start(transport.clone(), SessionConfig::default()).await
        );
        settle().await;
        (transport, controller)
    }

    async fn scan_and_connect(transport: &MockTransport, controller: &DeviceController) {
        assert!(assert_ok!(controller.start_scan().await));
        tokio::time::sleep(Duration::from_millis(600)).await;
        transport.advertise(reabilita("A"));
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        let found = controller.discovery_results().await;
        assert_eq!(found.len(), 1);
        assert!(assert_ok!(controller.connect_to(&found[0]).await));
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reads_adapter_state() {
        let (_, controller) = controller().await;

        assert_eq!(controller.adapter_power_state(), AdapterPowerState::PoweredOn);
        assert_eq!(controller.connected_peripheral(), None);
        assert!(!controller.is_running());
        assert!(!controller.has_scanned_once().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_scenario() {
        let (transport, controller) = controller().await;
        scan_and_connect(&transport, &controller).await;

        assert_eq!(controller.set_speed(3).await, Some(3));
        assert_eq!(controller.set_intensity(2).await, Some(2));
        assert_eq!(controller.set_repetitions(10).await, Some(10));

        let started = assert_ok!(controller.toggle().await);
        assert!(matches!(started, Some(Command::Start(_))));
        assert!(controller.is_running());

        let stopped = assert_ok!(controller.toggle().await);
        assert_eq!(stopped, Some(Command::Stop));
        assert!(!controller.is_running());

        assert_eq!(
            transport.written_commands(),
            vec!["LIGAR,3,2,10".to_string(), "DESLIGAR,0,0,0".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameters_locked_while_disconnected_or_running() {
        let (transport, controller) = controller().await;
        assert_eq!(controller.set_speed(4).await, None);
        assert_eq!(controller.parameters().await.speed(), 1);

        scan_and_connect(&transport, &controller).await;
        assert_eq!(controller.increment(Parameter::Speed).await, Some(2));

        assert_ok!(controller.toggle().await);
        assert!(!controller.parameters_editable());
        assert_eq!(controller.increment(Parameter::Speed).await, None);
        assert_eq!(controller.parameters().await.speed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_stop_at_bounds() {
        let (transport, controller) = controller().await;
        scan_and_connect(&transport, &controller).await;

        controller.set_speed(5).await;
        assert_eq!(controller.increment(Parameter::Speed).await, Some(5));
        assert_eq!(controller.decrement(Parameter::Repetitions).await, Some(1));
        assert_eq!(controller.set_repetitions(40).await, Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_resets_everything() {
        let (transport, controller) = controller().await;
        scan_and_connect(&transport, &controller).await;
        assert_ok!(controller.toggle().await);
        let mut notices = controller.notices();

        transport.set_power(AdapterPowerState::PoweredOff);
        settle().await;

        assert_eq!(controller.connected_peripheral(), None);
        assert_eq!(controller.adapter_power_state(), AdapterPowerState::PoweredOff);
        assert!(controller.discovery_results().await.is_empty());
        assert!(!controller.is_running());
        assert_eq!(assert_ok!(notices.recv().await), Notice::AdapterPoweredOff);

        assert_err!(controller.start_scan().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_mid_scan_returns_discovery_to_idle() {
        let (transport, controller) = controller().await;
        let mut notices = controller.notices();

        assert!(assert_ok!(controller.start_scan().await));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(transport.advertise(reabilita("A")));
        settle().await;
        assert_eq!(controller.discovery_results().await.len(), 1);

        transport.set_power(AdapterPowerState::PoweredOff);
        settle().await;

        assert_eq!(controller.discovery.phase().await, ScanPhase::Idle);
        assert!(!controller.is_scanning().await);
        assert!(controller.discovery_results().await.is_empty());
        assert!(!transport.is_scanning());
        assert_eq!(assert_ok!(notices.recv().await), Notice::AdapterPoweredOff);

        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert_eq!(controller.discovery.phase().await, ScanPhase::Idle);
        assert!(!controller.has_scanned_once().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_after_peer_disconnect() {
        let (transport, controller) = controller().await;
        scan_and_connect(&transport, &controller).await;

        transport.drop_link("A").await;
        settle().await;

        assert_eq!(controller.connected_peripheral(), None);
        assert_eq!(controller.adapter_power_state(), AdapterPowerState::Unknown);
        assert!(!controller.has_scanned_once().await);
        assert!(assert_ok!(controller.start_scan().await));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let (transport, controller) = controller().await;
        scan_and_connect(&transport, &controller).await;

        controller.shutdown().await;

        assert!(!transport.is_connected("A"));
    }
}
