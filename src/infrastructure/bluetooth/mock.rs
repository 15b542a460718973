//! In-memory adapter
//!
//! Scripted stand-in for the platform stack. Tests drive it directly; the
//! app uses it when `simulated_adapter` is enabled.

use crate::domain::models::{
    AdapterState, CharacteristicDescriptor, DeviceId, DiscoveredDevice, ScanFilter,
    ServiceDescriptor,
};
use crate::infrastructure::bluetooth::adapter::{
    encode_value, BleAdapter, Connection, DisconnectionWatch, Notifications, ScanResults,
};
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// A peripheral the mock knows about.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub device: DiscoveredDevice,
    pub services: Vec<(ServiceDescriptor, Vec<CharacteristicDescriptor>)>,
    pub reachable: bool,
}

impl MockPeripheral {
    pub fn new(device: DiscoveredDevice) -> Self {
        Self {
            device,
            services: Vec::new(),
            reachable: true,
        }
    }

    pub fn with_service(mut self, service_id: &str, characteristics: &[(&str, bool)]) -> Self {
        let characteristics = characteristics
            .iter()
            .map(|(id, notifiable)| CharacteristicDescriptor {
                id: id.to_string(),
                service_id: service_id.to_string(),
                is_notifiable: *notifiable,
                is_readable: true,
                ..Default::default()
            })
            .collect();
        self.services.push((
            ServiceDescriptor {
                id: service_id.to_string(),
            },
            characteristics,
        ));
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

/// Adapter calls, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    ObserveDisconnection(DeviceId),
    Scan,
    StopScan,
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    Services(DeviceId),
    Characteristics(DeviceId, String),
    Subscribe {
        device: DeviceId,
        service_id: String,
        characteristic_id: String,
    },
    CancelTransactions(String),
    Disconnect(DeviceId),
    Destroy,
}

struct Subscriber {
    device: DeviceId,
    service_id: String,
    characteristic_id: String,
    transaction: String,
    sender: mpsc::UnboundedSender<Result<String, BleError>>,
}

type Watcher = (DeviceId, oneshot::Sender<Result<DeviceId, BleError>>);

#[derive(Default)]
struct MockState {
    peripherals: Vec<MockPeripheral>,
    scanners: Vec<mpsc::UnboundedSender<Result<DiscoveredDevice, BleError>>>,
    connected: HashSet<DeviceId>,
    discovered: HashSet<DeviceId>,
    subscribers: Vec<Subscriber>,
    watchers: Vec<Watcher>,
    calls: Vec<AdapterCall>,
    fail_discovery: bool,
    fail_services: bool,
    fail_subscribe: bool,
    fail_disconnect: bool,
}

pub struct MockBleAdapter {
    state: Mutex<MockState>,
    radio: watch::Sender<AdapterState>,
    feed_interval: Option<Duration>,
}

impl Default for MockBleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBleAdapter {
    /// Powered-on adapter with no peripherals.
    pub fn new() -> Self {
        let (radio, _) = watch::channel(AdapterState::PoweredOn);
        Self {
            state: Mutex::new(MockState::default()),
            radio,
            feed_interval: None,
        }
    }

    /// A demo air-quality sensor plus an unnamed beacon.
    pub fn with_sample_data() -> Self {
        let adapter = Self::new();
        adapter.add_peripheral(
            MockPeripheral::new(
                DiscoveredDevice::new("D4:36:39:6F:A1:02")
                    .with_name("AirSensor")
                    .with_signal_strength(-58),
            )
            .with_service(
                "0000181a-0000-1000-8000-00805f9b34fb",
                &[
                    ("00002a6e-0000-1000-8000-00805f9b34fb", true),
                    ("00002a6f-0000-1000-8000-00805f9b34fb", true),
                    ("00002a29-0000-1000-8000-00805f9b34fb", false),
                ],
            )
            .with_service(
                "0000180f-0000-1000-8000-00805f9b34fb",
                &[("00002a19-0000-1000-8000-00805f9b34fb", true)],
            ),
        );
        adapter.add_peripheral(MockPeripheral::new(
            DiscoveredDevice::new("5C:F3:70:0B:11:9E").with_signal_strength(-81),
        ));
        adapter
    }

    /// Every subscription receives a counter value at this interval.
    pub fn with_feed(mut self, interval: Duration) -> Self {
        self.feed_interval = Some(interval);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.lock().peripherals.push(peripheral);
    }

    pub fn set_state(&self, state: AdapterState) {
        self.radio.send_replace(state);
    }

    /// Report an advertisement to every running scan.
    pub fn advertise(&self, device: &DiscoveredDevice) {
        let mut state = self.lock();
        state
            .scanners
            .retain(|scanner| scanner.unbounded_send(Ok(device.clone())).is_ok());
    }

    /// Deliver a scan error to every running scan.
    pub fn fail_scan(&self, error: BleError) {
        let mut state = self.lock();
        for scanner in state.scanners.drain(..) {
            let _ = scanner.unbounded_send(Err(error.clone()));
        }
    }

    /// Push a notification; returns how many subscriptions received it.
    pub fn notify(
        &self,
        device: &DeviceId,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> usize {
        let encoded = encode_value(value);
        let mut state = self.lock();
        let mut delivered = 0;
        state.subscribers.retain(|sub| {
            if sub.device != *device
                || sub.service_id != service_id
                || sub.characteristic_id != characteristic_id
            {
                return true;
            }
            let open = sub.sender.unbounded_send(Ok(encoded.clone())).is_ok();
            if open {
                delivered += 1;
            }
            open
        });
        delivered
    }

    /// Simulate the peripheral going away.
    pub fn drop_link(&self, device: &DeviceId) {
        let mut state = self.lock();
        state.connected.remove(device);
        state.discovered.remove(device);
        state.subscribers.retain(|sub| sub.device != *device);
        fire_watchers(&mut state.watchers, device, Ok(device.clone()));
    }

    /// Make the disconnection watch for `device` fail.
    pub fn fail_disconnection_watch(&self, device: &DeviceId, error: BleError) {
        let mut state = self.lock();
        fire_watchers(&mut state.watchers, device, Err(error));
    }

    pub fn set_fail_discovery(&self, fail: bool) {
        self.lock().fail_discovery = fail;
    }

    pub fn set_fail_services(&self, fail: bool) {
        self.lock().fail_services = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.lock().fail_disconnect = fail;
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.lock().connected.contains(device)
    }

    pub fn subscription_count(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .count()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanners.iter().any(|s| !s.is_closed())
    }

    fn record(&self, call: AdapterCall) {
        self.lock().calls.push(call);
    }

    fn radio_state(&self) -> AdapterState {
        *self.radio.borrow()
    }

    fn find_service(
        &self,
        device: &DeviceId,
        service_id: &str,
    ) -> Result<Vec<CharacteristicDescriptor>, BleError> {
        let state = self.lock();
        if !state.discovered.contains(device) {
            return Err(BleError::NotConnected(device.clone()));
        }
        state
            .peripherals
            .iter()
            .find(|p| p.device.id == *device)
            .and_then(|p| p.services.iter().find(|(s, _)| s.id == service_id))
            .map(|(_, chars)| chars.clone())
            .ok_or_else(|| BleError::ServiceDiscoveryFailed(format!("unknown service {service_id}")))
    }
}

fn fire_watchers(watchers: &mut Vec<Watcher>, device: &DeviceId, result: Result<DeviceId, BleError>) {
    let (fired, kept): (Vec<_>, Vec<_>) = watchers.drain(..).partition(|(id, _)| id == device);
    *watchers = kept;
    for (_, sender) in fired {
        let _ = sender.send(result.clone());
    }
}

fn spawn_feed(sender: mpsc::UnboundedSender<Result<String, BleError>>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut counter: u16 = 0;
        loop {
            ticker.tick().await;
            counter = counter.wrapping_add(1);
            if sender
                .unbounded_send(Ok(encode_value(&counter.to_le_bytes())))
                .is_err()
            {
                break;
            }
        }
    });
}

#[async_trait]
impl BleAdapter for MockBleAdapter {
    fn observe_state(&self) -> watch::Receiver<AdapterState> {
        self.radio.subscribe()
    }

    fn observe_disconnection(&self, device: &DeviceId) -> DisconnectionWatch {
        self.record(AdapterCall::ObserveDisconnection(device.clone()));
        if device.is_empty() {
            return futures::future::ready(Err(BleError::InvalidDeviceId)).boxed();
        }

        let (tx, rx) = oneshot::channel();
        self.lock().watchers.push((device.clone(), tx));
        rx.map(|result| result.unwrap_or(Err(BleError::Cancelled)))
            .boxed()
    }

    fn scan(&self, _filter: &ScanFilter) -> ScanResults {
        self.record(AdapterCall::Scan);
        let (tx, rx) = mpsc::unbounded();

        let radio = self.radio_state();
        if !radio.is_powered_on() {
            let _ = tx.unbounded_send(Err(BleError::AdapterUnavailable(radio)));
            return rx.boxed();
        }

        let mut state = self.lock();
        for peripheral in &state.peripherals {
            let _ = tx.unbounded_send(Ok(peripheral.device.clone()));
        }
        state.scanners.push(tx);
        rx.boxed()
    }

    fn stop_scan(&self) {
        let mut state = self.lock();
        state.calls.push(AdapterCall::StopScan);
        state.scanners.clear();
    }

    async fn connect(&self, device: &DeviceId) -> Result<Connection, BleError> {
        self.record(AdapterCall::Connect(device.clone()));
        let radio = self.radio_state();
        if !radio.is_powered_on() {
            return Err(BleError::AdapterUnavailable(radio));
        }

        let mut state = self.lock();
        let peripheral = state
            .peripherals
            .iter()
            .find(|p| p.device.id == *device)
            .ok_or_else(|| BleError::DeviceNotFound(device.clone()))?;
        if !peripheral.reachable {
            return Err(BleError::ConnectionFailed("device unreachable".to_string()));
        }

        state.connected.insert(device.clone());
        Ok(Connection {
            device: device.clone(),
        })
    }

    async fn discover_services_and_characteristics(
        &self,
        connection: &Connection,
    ) -> Result<(), BleError> {
        self.record(AdapterCall::DiscoverServices(connection.device.clone()));
        let mut state = self.lock();
        if state.fail_discovery {
            return Err(BleError::ServiceDiscoveryFailed(
                "GATT discovery failed".to_string(),
            ));
        }
        if !state.connected.contains(&connection.device) {
            return Err(BleError::ServiceDiscoveryFailed(
                "link dropped during discovery".to_string(),
            ));
        }
        state.discovered.insert(connection.device.clone());
        Ok(())
    }

    async fn services(&self, device: &DeviceId) -> Result<Vec<ServiceDescriptor>, BleError> {
        self.record(AdapterCall::Services(device.clone()));
        let state = self.lock();
        if state.fail_services {
            return Err(BleError::ServiceDiscoveryFailed(
                "service enumeration failed".to_string(),
            ));
        }
        if !state.discovered.contains(device) {
            return Err(BleError::NotConnected(device.clone()));
        }
        Ok(state
            .peripherals
            .iter()
            .find(|p| p.device.id == *device)
            .map(|p| p.services.iter().map(|(s, _)| s.clone()).collect())
            .unwrap_or_default())
    }

    async fn characteristics(
        &self,
        device: &DeviceId,
        service: &ServiceDescriptor,
    ) -> Result<Vec<CharacteristicDescriptor>, BleError> {
        self.record(AdapterCall::Characteristics(
            device.clone(),
            service.id.clone(),
        ));
        self.find_service(device, &service.id)
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        service_id: &str,
        characteristic_id: &str,
        transaction: &str,
    ) -> Result<Notifications, BleError> {
        self.record(AdapterCall::Subscribe {
            device: device.clone(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        if self.lock().fail_subscribe {
            return Err(BleError::SubscriptionFailed(
                "CCCD write rejected".to_string(),
            ));
        }

        let characteristic = self
            .find_service(device, service_id)?
            .into_iter()
            .find(|c| c.id == characteristic_id)
            .ok_or_else(|| {
                BleError::SubscriptionFailed(format!("unknown characteristic {characteristic_id}"))
            })?;
        if !characteristic.is_notifiable {
            return Err(BleError::SubscriptionFailed(format!(
                "{characteristic_id} is not notifiable"
            )));
        }

        let (tx, rx) = mpsc::unbounded();
        if let Some(interval) = self.feed_interval {
            spawn_feed(tx.clone(), interval);
        }
        self.lock().subscribers.push(Subscriber {
            device: device.clone(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            transaction: transaction.to_string(),
            sender: tx,
        });
        debug!("Mock subscription on {}/{}", service_id, characteristic_id);
        Ok(rx.boxed())
    }

    fn cancel_transactions(&self, transaction: &str) {
        let mut state = self.lock();
        state
            .calls
            .push(AdapterCall::CancelTransactions(transaction.to_string()));
        state.subscribers.retain(|sub| sub.transaction != transaction);
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(AdapterCall::Disconnect(device.clone()));
        let mut state = self.lock();
        if state.fail_disconnect {
            return Err(BleError::Platform("connection release failed".to_string()));
        }
        state.connected.remove(device);
        state.discovered.remove(device);
        state.subscribers.retain(|sub| sub.device != *device);
        fire_watchers(&mut state.watchers, device, Ok(device.clone()));
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.lock();
        state.calls.push(AdapterCall::Destroy);
        state.scanners.clear();
        state.subscribers.clear();
        state.watchers.clear();
        state.connected.clear();
        state.discovered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_reports_known_peripherals() {
        let adapter = MockBleAdapter::with_sample_data();
        let mut results = adapter.scan(&ScanFilter::default());

        let first = results.next().await.unwrap().unwrap();
        assert_eq!(first.name.as_deref(), Some("AirSensor"));
        let second = results.next().await.unwrap().unwrap();
        assert!(second.name.is_none());
    }

    #[tokio::test]
    async fn test_scan_with_radio_off_fails_in_band() {
        let adapter = MockBleAdapter::with_sample_data();
        adapter.set_state(AdapterState::PoweredOff);

        let mut results = adapter.scan(&ScanFilter::default());
        assert_eq!(
            results.next().await,
            Some(Err(BleError::AdapterUnavailable(AdapterState::PoweredOff)))
        );
        assert_eq!(results.next().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_subscriptions() {
        let adapter = MockBleAdapter::new();
        let id = DeviceId::new("X");
        adapter.add_peripheral(
            MockPeripheral::new(DiscoveredDevice::new("X")).with_service("S1", &[("C1", true)]),
        );

        let connection = adapter.connect(&id).await.unwrap();
        adapter
            .discover_services_and_characteristics(&connection)
            .await
            .unwrap();
        let _stream = adapter.subscribe(&id, "S1", "C1", "stream").await.unwrap();
        assert_eq!(adapter.notify(&id, "S1", "C1", &[1]), 1);

        adapter.disconnect(&id).await.unwrap();
        assert_eq!(adapter.notify(&id, "S1", "C1", &[2]), 0);
        assert!(!adapter.is_connected(&id));
    }

    #[tokio::test]
    async fn test_watch_on_empty_id_errors() {
        let adapter = MockBleAdapter::new();
        let result = adapter.observe_disconnection(&DeviceId::new("")).await;
        assert_eq!(result, Err(BleError::InvalidDeviceId));
    }
}
