use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ReabilitaError, Result},
    transport::{DisconnectHandler, ScanPredicate, Transport},
    types::{AdapterPowerState, Connection, PeripheralHandle},
    COMMAND_CHAR_UUID, SERVICE_UUID, STATUS_CHAR_UUID,
};

/// [`Transport`] backed by the platform Bluetooth stack through btleplug
///
/// Peripherals are remembered by id as scans surface them, so a handle from
/// the scan results can be connected later.
pub struct BtleTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    // One disconnect watcher per connection id
    watchers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    // Adapter events opened before each connect, handed to its watcher
    link_events: Mutex<HashMap<String, BoxStream<'static, CentralEvent>>>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`ReabilitaError::AdapterUnavailable`] if the machine has no
    /// adapter, or [`ReabilitaError::Ble`] if the stack cannot be reached.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ReabilitaError::AdapterUnavailable {
                state: AdapterPowerState::Unsupported,
            })?;

        info!("bluetooth adapter opened");
        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter
    #[must_use]
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            link_events: Mutex::new(HashMap::new()),
        }
    }

    async fn known_peripheral(&self, id: &str) -> Option<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(id) {
            return Some(peripheral.clone());
        }

        let peripherals = self.adapter.peripherals().await.ok()?;
        let peripheral = peripherals.into_iter().find(|p| p.id().to_string() == id)?;
        self.peripherals
            .lock()
            .await
            .insert(id.to_string(), peripheral.clone());
        Some(peripheral)
    }

    async fn linked_peripheral(&self, connection: &Connection) -> Result<Peripheral> {
        self.known_peripheral(connection.id())
            .await
            .ok_or(ReabilitaError::NotConnected)
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service && c.uuid == characteristic)
}

fn require_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic> {
    find_characteristic(peripheral, service, characteristic).ok_or_else(|| {
        ReabilitaError::Discovery(format!(
            "characteristic {characteristic} not found in service {service}"
        ))
    })
}

#[async_trait]
impl Transport for BtleTransport {
    async fn power_state(&self) -> Result<AdapterPowerState> {
        Ok(self.adapter.adapter_state().await?.into())
    }

    async fn power_states(&self) -> Result<BoxStream<'static, AdapterPowerState>> {
        let events = self.adapter.events().await?;
        let current = self.power_state().await?;

        let changes = events.filter_map(|event| {
            future::ready(match event {
                CentralEvent::StateUpdate(state) => Some(AdapterPowerState::from(state)),
                _ => None,
            })
        });
        Ok(stream::once(future::ready(current)).chain(changes).boxed())
    }

    async fn start_scan(
        &self,
        predicate: ScanPredicate,
    ) -> Result<BoxStream<'static, PeripheralHandle>> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ReabilitaError::ScanStart(e.to_string()))?;
        debug!("platform scan started");

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let handles = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let predicate = predicate.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let handle = PeripheralHandle::new(id.to_string(), properties.local_name);
                if !predicate(&handle) {
                    return None;
                }
                peripherals.lock().await.insert(handle.id.clone(), peripheral);
                Some(handle)
            }
        });
        Ok(handles.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop scan ignored");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection> {
        let power = self.power_state().await?;
        if !power.is_powered_on() {
            return Err(ReabilitaError::ConnectFailed(format!("adapter is {power}")));
        }

        let device = self.known_peripheral(&peripheral.id).await.ok_or_else(|| {
            ReabilitaError::ConnectFailed(format!("{} is not in range", peripheral.id))
        })?;

        // Subscribed first so a drop right after connecting still reaches the watcher
        let events = self.adapter.events().await?;
        device
            .connect()
            .await
            .map_err(|e| ReabilitaError::ConnectFailed(e.to_string()))?;
        self.link_events
            .lock()
            .await
            .insert(peripheral.id.clone(), events);
        debug!(peripheral = %peripheral.id, "link established");
        Ok(Connection::new(peripheral.clone()))
    }

    async fn discover_capabilities(&self, connection: &Connection) -> Result<()> {
        let peripheral = self.linked_peripheral(connection).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| ReabilitaError::Discovery(e.to_string()))?;

        require_characteristic(&peripheral, SERVICE_UUID, COMMAND_CHAR_UUID)?;
        require_characteristic(&peripheral, SERVICE_UUID, STATUS_CHAR_UUID)?;
        debug!(peripheral = %connection.id(), "service resolved");
        Ok(())
    }

    async fn write(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()> {
        let peripheral = self
            .linked_peripheral(connection)
            .await
            .map_err(|e| ReabilitaError::Write(e.to_string()))?;
        let target = require_characteristic(&peripheral, service, characteristic)
            .map_err(|e| ReabilitaError::Write(e.to_string()))?;

        debug!(peripheral = %connection.id(), bytes = payload.len(), "write");
        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(|e| ReabilitaError::Write(e.to_string()))
    }

    async fn read(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        let peripheral = self
            .linked_peripheral(connection)
            .await
            .map_err(|e| ReabilitaError::Read(e.to_string()))?;
        let target = require_characteristic(&peripheral, service, characteristic)
            .map_err(|e| ReabilitaError::Read(e.to_string()))?;

        let value = peripheral
            .read(&target)
            .await
            .map_err(|e| ReabilitaError::Read(e.to_string()))?;
        Ok(Bytes::from(value))
    }

    async fn subscribe(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Bytes>> {
        let peripheral = self.linked_peripheral(connection).await?;
        let target = require_characteristic(&peripheral, service, characteristic)?;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;
        debug!(peripheral = %connection.id(), %characteristic, "subscribed");

        let payloads = notifications.filter_map(move |notification| {
            future::ready(
                (notification.uuid == characteristic).then(|| Bytes::from(notification.value)),
            )
        });
        Ok(payloads.boxed())
    }

    async fn unsubscribe(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let Some(peripheral) = self.known_peripheral(connection.id()).await else {
            return Ok(());
        };
        let Some(target) = find_characteristic(&peripheral, service, characteristic) else {
            return Ok(());
        };
        if let Err(e) = peripheral.unsubscribe(&target).await {
            debug!(peripheral = %connection.id(), error = %e, "unsubscribe ignored");
        }
        Ok(())
    }

    async fn on_disconnect(
        &self,
        connection: &Connection,
        handler: DisconnectHandler,
    ) -> Result<bool> {
        let mut watchers = self.watchers.lock().await;
        if watchers
            .get(connection.id())
            .is_some_and(|watcher| !watcher.is_finished())
        {
            return Ok(false);
        }

        let peripheral = self.linked_peripheral(connection).await?;
        let target = peripheral.id();
        let pending = self.link_events.lock().await.remove(connection.id());
        let mut events = match pending {
            Some(events) => events,
            None => self.adapter.events().await?,
        };
        let registry = self.watchers.clone();
        let key = connection.id().to_string();
        let connection = connection.clone();

        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == target {
                        info!(peripheral = %connection.id(), "link lost");
                        registry.lock().await.remove(connection.id());
                        handler(connection).await;
                        return;
                    }
                }
            }
            warn!(peripheral = %connection.id(), "adapter event stream ended before disconnect");
        });

        watchers.insert(key, watcher);
        Ok(true)
    }

    async fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.link_events.lock().await.remove(connection.id());
        let peripheral = self.linked_peripheral(connection).await?;
        peripheral.disconnect().await?;
        Ok(())
    }
}
