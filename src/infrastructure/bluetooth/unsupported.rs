//! Fallback backend for platforms without a native BLE integration.
//!
//! Reports [`AdapterState::Unsupported`] forever and refuses every operation,
//! which keeps the UI on its blocked view.

use crate::domain::models::{
    AdapterState, CharacteristicDescriptor, DeviceId, ScanFilter, ServiceDescriptor,
};
use crate::infrastructure::bluetooth::adapter::{
    BleAdapter, Connection, DisconnectionWatch, Notifications, ScanResults,
};
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;

const UNAVAILABLE: BleError = BleError::AdapterUnavailable(AdapterState::Unsupported);

pub struct UnsupportedAdapter {
    state: watch::Sender<AdapterState>,
}

impl Default for UnsupportedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl UnsupportedAdapter {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AdapterState::Unsupported);
        Self { state }
    }
}

#[async_trait]
impl BleAdapter for UnsupportedAdapter {
    fn observe_state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    fn observe_disconnection(&self, _device: &DeviceId) -> DisconnectionWatch {
        futures::future::ready(Err(UNAVAILABLE)).boxed()
    }

    fn scan(&self, _filter: &ScanFilter) -> ScanResults {
        futures::stream::once(async { Err(UNAVAILABLE) }).boxed()
    }

    fn stop_scan(&self) {}

    async fn connect(&self, _device: &DeviceId) -> Result<Connection, BleError> {
        Err(UNAVAILABLE)
    }

    async fn discover_services_and_characteristics(
        &self,
        _connection: &Connection,
    ) -> Result<(), BleError> {
        Err(UNAVAILABLE)
    }

    async fn services(&self, _device: &DeviceId) -> Result<Vec<ServiceDescriptor>, BleError> {
        Err(UNAVAILABLE)
    }

    async fn characteristics(
        &self,
        _device: &DeviceId,
        _service: &ServiceDescriptor,
    ) -> Result<Vec<CharacteristicDescriptor>, BleError> {
        Err(UNAVAILABLE)
    }

    async fn subscribe(
        &self,
        _device: &DeviceId,
        _service_id: &str,
        _characteristic_id: &str,
        _transaction: &str,
    ) -> Result<Notifications, BleError> {
        Err(UNAVAILABLE)
    }

    fn cancel_transactions(&self, _transaction: &str) {}

    async fn disconnect(&self, _device: &DeviceId) -> Result<(), BleError> {
        Ok(())
    }

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_unsupported() {
        let adapter = UnsupportedAdapter::new();
        assert_eq!(*adapter.observe_state().borrow(), AdapterState::Unsupported);

        let first = adapter.scan(&ScanFilter::default()).next().await;
        assert_eq!(first, Some(Err(UNAVAILABLE)));
        assert_eq!(
            adapter.connect(&DeviceId::new("X")).await,
            Err(UNAVAILABLE)
        );
    }
}
