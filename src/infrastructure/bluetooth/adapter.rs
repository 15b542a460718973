//! Bluetooth Adapter Facade
//!
//! The one seam between the app and a platform BLE stack. Backends only
//! pass calls through and normalize results; all policy lives in the
//! controllers.

use crate::domain::models::{
    AdapterState, CharacteristicDescriptor, DeviceId, DiscoveredDevice, ScanFilter,
    ServiceDescriptor,
};
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::watch;

/// Advertisements in delivery order. The same device may appear many times.
/// Scan failures arrive in-band and end the scan.
pub type ScanResults = BoxStream<'static, Result<DiscoveredDevice, BleError>>;

/// Encoded notification payloads for one characteristic, in the order the
/// peripheral sent them. Dropping the stream unsubscribes.
pub type Notifications = BoxStream<'static, Result<String, BleError>>;

/// Resolves once, when the watched device disconnects, or with an error if
/// the watch itself could not be established.
pub type DisconnectionWatch = BoxFuture<'static, Result<DeviceId, BleError>>;

/// Link established by [`BleAdapter::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub device: DeviceId,
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current radio state, then every change. The receiver already holds
    /// the current value when returned.
    fn observe_state(&self) -> watch::Receiver<AdapterState>;

    /// Single-fire disconnection watch. Re-arm after it fires.
    fn observe_disconnection(&self, device: &DeviceId) -> DisconnectionWatch;

    /// Begin an unbounded scan. Deduplication is the caller's job.
    fn scan(&self, filter: &ScanFilter) -> ScanResults;

    /// Idempotent.
    fn stop_scan(&self);

    async fn connect(&self, device: &DeviceId) -> Result<Connection, BleError>;

    /// Must complete before services or characteristics can be listed.
    async fn discover_services_and_characteristics(
        &self,
        connection: &Connection,
    ) -> Result<(), BleError>;

    async fn services(&self, device: &DeviceId) -> Result<Vec<ServiceDescriptor>, BleError>;

    async fn characteristics(
        &self,
        device: &DeviceId,
        service: &ServiceDescriptor,
    ) -> Result<Vec<CharacteristicDescriptor>, BleError>;

    /// Subscribe to notifications of one characteristic. `transaction`
    /// groups subscriptions for [`BleAdapter::cancel_transactions`].
    async fn subscribe(
        &self,
        device: &DeviceId,
        service_id: &str,
        characteristic_id: &str,
        transaction: &str,
    ) -> Result<Notifications, BleError>;

    /// Best effort: values already queued may still be delivered.
    fn cancel_transactions(&self, transaction: &str);

    /// Idempotent. Invalidates every subscription of the device.
    async fn disconnect(&self, device: &DeviceId) -> Result<(), BleError>;

    /// Release the platform stack. Called once on shutdown.
    fn destroy(&self);
}

/// Normalized text form of a raw characteristic value.
pub fn encode_value(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
