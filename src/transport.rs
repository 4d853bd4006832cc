use async_trait::async_trait;
use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{AdapterPowerState, Connection, PeripheralHandle},
};

/// Decides which advertisements a scan surfaces
pub type ScanPredicate = Arc<dyn Fn(&PeripheralHandle) -> bool + Send + Sync>;

/// Callback run once when a connection drops
pub type DisconnectHandler = Box<dyn FnOnce(Connection) -> BoxFuture<'static, ()> + Send>;

/// Platform wireless stack as seen by the sessions
///
/// Every operation may fail transiently; failures come back as typed errors and
/// never panic. Cancellation-style operations ([`Transport::stop_scan`],
/// [`Transport::unsubscribe`]) succeed when there is nothing left to cancel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current adapter power state
    async fn power_state(&self) -> Result<AdapterPowerState>;

    /// Power state changes, starting with the current state
    async fn power_states(&self) -> Result<BoxStream<'static, AdapterPowerState>>;

    /// Start scanning; only handles accepted by `predicate` are yielded
    ///
    /// Callers stop any previous scan first.
    async fn start_scan(
        &self,
        predicate: ScanPredicate,
    ) -> Result<BoxStream<'static, PeripheralHandle>>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a scanned peripheral
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection>;

    /// Resolve the expected service and characteristics on a fresh link
    async fn discover_capabilities(&self, connection: &Connection) -> Result<()>;

    /// Write with response
    async fn write(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()>;

    /// Read the current characteristic value
    async fn read(&self, connection: &Connection, service: Uuid, characteristic: Uuid)
        -> Result<Bytes>;

    /// Notification payloads for a characteristic, ending on unsubscribe or disconnect
    async fn subscribe(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Bytes>>;

    /// Stop notifications for a characteristic
    async fn unsubscribe(
        &self,
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;

    /// Register the disconnect handler for a connection
    ///
    /// Only one handler per connection is kept until it fires. Returns `false`
    /// when a handler was already registered and `handler` was dropped.
    async fn on_disconnect(&self, connection: &Connection, handler: DisconnectHandler)
        -> Result<bool>;

    /// Tear down a link; the registered disconnect handler still runs
    async fn disconnect(&self, connection: &Connection) -> Result<()>;
}
