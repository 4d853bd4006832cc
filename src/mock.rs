//! In-memory [`Transport`] for driving the sessions without a radio.
//!
//! Tests script the peripheral side: advertise handles, push notifications,
//! set the value returned by reads, inject failures and drop links.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::{
    error::{ReabilitaError, Result},
    protocol::decode_payload,
    transport::{DisconnectHandler, ScanPredicate, Transport},
    types::{AdapterPowerState, Connection, PeripheralHandle},
};

struct ActiveScan {
    sender: mpsc::UnboundedSender<PeripheralHandle>,
    predicate: ScanPredicate,
}

#[derive(Default)]
struct MockState {
    power: AdapterPowerState,
    power_watchers: Vec<mpsc::UnboundedSender<AdapterPowerState>>,
    scan: Option<ActiveScan>,
    scan_starts: usize,
    connections: HashMap<String, Connection>,
    status: Bytes,
    writes: Vec<Bytes>,
    reads: usize,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    handlers: HashMap<String, DisconnectHandler>,
    handler_registrations: usize,
    failing: HashSet<MockOperation>,
    gates: HashMap<MockOperation, Arc<Semaphore>>,
}

/// Operation that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// [`Transport::start_scan`]
    Scan,
    /// [`Transport::connect`]
    Connect,
    /// [`Transport::discover_capabilities`]
    Discover,
    /// [`Transport::write`]
    Write,
    /// [`Transport::read`]
    Read,
    /// [`Transport::on_disconnect`]
    DisconnectWatch,
}

/// Scriptable in-memory transport
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

fn receiver_stream<T: Send + 'static>(receiver: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
    .boxed()
}

impl MockTransport {
    /// Create a transport whose adapter reports `power`
    #[must_use]
    pub fn new(power: AdapterPowerState) -> Self {
        let transport = Self::default();
        transport.lock().power = power;
        transport
    }

    /// Create a transport with the adapter powered on
    #[must_use]
    pub fn powered_on() -> Self {
        Self::new(AdapterPowerState::PoweredOn)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Change the adapter power state and notify watchers
    pub fn set_power(&self, power: AdapterPowerState) {
        let mut state = self.lock();
        state.power = power;
        state.power_watchers.retain(|watcher| watcher.send(power).is_ok());
    }

    /// Make an operation fail (or succeed again)
    pub fn set_failing(&self, operation: MockOperation, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(operation);
        } else {
            state.failing.remove(&operation);
        }
    }

    /// Hold calls of an operation until [`MockTransport::resume`]
    ///
    /// Writes, reads and disconnect registrations can be held. They check the
    /// link before waiting and complete afterwards, like a request already on
    /// the air.
    pub fn pause(&self, operation: MockOperation) {
        self.lock()
            .gates
            .entry(operation)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Release every call held by [`MockTransport::pause`]
    pub fn resume(&self, operation: MockOperation) {
        if let Some(gate) = self.lock().gates.remove(&operation) {
            gate.close();
        }
    }

    async fn pass_gate(&self, operation: MockOperation) {
        let gate = self.lock().gates.get(&operation).cloned();
        if let Some(gate) = gate {
            // A closed gate is an open door
            let _released = gate.acquire().await;
        }
    }

    /// Deliver an advertisement to the running scan; returns whether it was accepted
    pub fn advertise(&self, peripheral: PeripheralHandle) -> bool {
        let state = self.lock();
        match &state.scan {
            Some(scan) if (scan.predicate)(&peripheral) => scan.sender.send(peripheral).is_ok(),
            _ => false,
        }
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    /// Number of scans started so far
    #[must_use]
    pub fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }

    /// Set the value returned by reads
    pub fn set_status(&self, text: &str) {
        self.lock().status = Bytes::copy_from_slice(text.as_bytes());
    }

    /// Push a notification to the subscriber of a connection
    pub fn notify(&self, connection_id: &str, payload: &[u8]) -> bool {
        self.lock()
            .subscriptions
            .get(connection_id)
            .is_some_and(|sender| sender.send(Bytes::copy_from_slice(payload)).is_ok())
    }

    /// Commands written so far, decoded to text
    #[must_use]
    pub fn written_commands(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .map(|payload| decode_payload(payload))
            .collect()
    }

    /// Number of reads served
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Number of subscribe calls
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Number of unsubscribe calls
    #[must_use]
    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribe_calls
    }

    /// Number of disconnect handlers accepted
    #[must_use]
    pub fn handler_registrations(&self) -> usize {
        self.lock().handler_registrations
    }

    /// Whether a link to `connection_id` is open
    #[must_use]
    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.lock().connections.contains_key(connection_id)
    }

    /// Simulate the peripheral dropping the link
    pub async fn drop_link(&self, connection_id: &str) {
        let (connection, handler) = {
            let mut state = self.lock();
            state.subscriptions.remove(connection_id);
            (
                state.connections.remove(connection_id),
                state.handlers.remove(connection_id),
            )
        };

        if let (Some(connection), Some(handler)) = (connection, handler) {
            handler(connection).await;
        }
    }

    fn ensure_connected(state: &MockState, connection: &Connection) -> Result<()> {
        if state.connections.contains_key(connection.id()) {
            Ok(())
        } else {
            Err(ReabilitaError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn power_state(&self) -> Result<AdapterPowerState> {
        Ok(self.lock().power)
    }

    async fn power_states(&self) -> Result<BoxStream<'static, AdapterPowerState>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let _ = sender.send(state.power);
        state.power_watchers.push(sender);
        Ok(receiver_stream(receiver))
    }

    async fn start_scan(
        &self,
        predicate: ScanPredicate,
    ) -> Result<BoxStream<'static, PeripheralHandle>> {
        let mut state = self.lock();
        if state.failing.contains(&MockOperation::Scan) {
            return Err(ReabilitaError::ScanStart("scan rejected".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.scan = Some(ActiveScan { sender, predicate });
        state.scan_starts += 1;
        Ok(receiver_stream(receiver))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.lock().scan = None;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection> {
        let mut state = self.lock();
        if !state.power.is_powered_on() {
            return Err(ReabilitaError::ConnectFailed(format!(
                "adapter is {}",
                state.power
            )));
        }
        if state.failing.contains(&MockOperation::Connect) {
            return Err(ReabilitaError::ConnectFailed(format!(
                "{} unreachable",
                peripheral.id
            )));
        }

        let connection = Connection::new(peripheral.clone());
        state
            .connections
            .insert(peripheral.id.clone(), connection.clone());
        Ok(connection)
    }

    async fn discover_capabilities(&self, connection: &Connection) -> Result<()> {
        let state = self.lock();
        Self::ensure_connected(&state, connection)?;
        if state.failing.contains(&MockOperation::Discover) {
            return Err(ReabilitaError::Discovery(
                "service 12345678-1234-1234-1234-123456789abc not found".to_string(),
            ));
        }
        Ok(())
    }

    async fn write(
        &self,
        connection: &Connection,
        _service: Uuid,
        _characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()> {
        {
            let state = self.lock();
            Self::ensure_connected(&state, connection)
                .map_err(|e| ReabilitaError::Write(e.to_string()))?;
            if state.failing.contains(&MockOperation::Write) {
                return Err(ReabilitaError::Write("gatt write rejected".to_string()));
            }
        }
        self.pass_gate(MockOperation::Write).await;
        self.lock().writes.push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn read(
        &self,
        connection: &Connection,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Bytes> {
        {
            let state = self.lock();
            Self::ensure_connected(&state, connection)
                .map_err(|e| ReabilitaError::Read(e.to_string()))?;
            if state.failing.contains(&MockOperation::Read) {
                return Err(ReabilitaError::Read("gatt read rejected".to_string()));
            }
        }
        self.pass_gate(MockOperation::Read).await;
        let mut state = self.lock();
        state.reads += 1;
        Ok(state.status.clone())
    }

    async fn subscribe(
        &self,
        connection: &Connection,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<BoxStream<'static, Bytes>> {
        let mut state = self.lock();
        Self::ensure_connected(&state, connection)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .subscriptions
            .insert(connection.id().to_string(), sender);
        state.subscribe_calls += 1;
        Ok(receiver_stream(receiver))
    }

    async fn unsubscribe(
        &self,
        connection: &Connection,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        let mut state = self.lock();
        state.subscriptions.remove(connection.id());
        state.unsubscribe_calls += 1;
        Ok(())
    }

    async fn on_disconnect(
        &self,
        connection: &Connection,
        handler: DisconnectHandler,
    ) -> Result<bool> {
        {
            let state = self.lock();
            if state.failing.contains(&MockOperation::DisconnectWatch) {
                return Err(ReabilitaError::Ble(btleplug::Error::NotSupported(
                    "adapter events unavailable".to_string(),
                )));
            }
            if state.handlers.contains_key(connection.id()) {
                return Ok(false);
            }
        }
        self.pass_gate(MockOperation::DisconnectWatch).await;

        let undelivered = {
            let mut state = self.lock();
            state.handler_registrations += 1;
            if state.connections.contains_key(connection.id()) {
                state
                    .handlers
                    .insert(connection.id().to_string(), handler);
                None
            } else {
                Some(handler)
            }
        };

        // The link dropped while registering; the queued loss is delivered at once
        if let Some(handler) = undelivered {
            handler(connection.clone()).await;
        }
        Ok(true)
    }

    async fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.drop_link(connection.id()).await;
        Ok(())
    }
}
