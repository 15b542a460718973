//! Device Discovery
//!
//! Runs a time-boxed scan, keeps one entry per device in first-seen order,
//! and drives a single connection attempt at a time.

use crate::domain::models::{AdapterState, DeviceId, DiscoveredDevice, ScanFilter};
use crate::infrastructure::bluetooth::adapter::{BleAdapter, ScanResults};
use crate::infrastructure::bluetooth::error::{BleError, SessionError};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

/// Configuration for discovery behavior
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long a scan runs before it stops on its own
    pub scan_timeout: Duration,
    /// Passed through to the adapter
    pub filter: ScanFilter,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            filter: ScanFilter::default(),
        }
    }
}

/// Outcome of a scan or connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// First sighting of a device in the current scan.
    Discovered(DiscoveredDevice),
    ScanFailed(BleError),
    ScanTimedOut,
    /// The adapter closed the result stream.
    ScanEnded,
    Connected(DiscoveredDevice),
    ConnectFailed {
        device: DiscoveredDevice,
        error: SessionError,
    },
}

struct ActiveScan {
    results: ScanResults,
    deadline: Pin<Box<Sleep>>,
}

struct PendingConnect {
    device: DiscoveredDevice,
    attempt: BoxFuture<'static, Result<(), BleError>>,
}

enum Polled {
    Scan(Option<Result<DiscoveredDevice, BleError>>),
    Deadline,
    Connect(Result<(), BleError>),
}

pub struct DiscoveryController {
    adapter: Arc<dyn BleAdapter>,
    config: DiscoveryConfig,
    adapter_state: AdapterState,
    devices: Vec<DiscoveredDevice>,
    scan: Option<ActiveScan>,
    pending: Option<PendingConnect>,
}

impl DiscoveryController {
    pub fn new(adapter: Arc<dyn BleAdapter>, config: DiscoveryConfig) -> Self {
        Self {
            adapter,
            config,
            adapter_state: AdapterState::Unknown,
            devices: Vec::new(),
            scan: None,
            pending: None,
        }
    }

    pub fn set_adapter_state(&mut self, state: AdapterState) {
        if self.adapter_state != state {
            info!("Adapter state: {} -> {}", self.adapter_state, state);
        }
        self.adapter_state = state;
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    /// Devices seen in the current (or last) scan, first-seen order.
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    pub fn find(&self, id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.id == *id)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// Device of the in-flight connection attempt, if any.
    pub fn connecting(&self) -> Option<&DeviceId> {
        self.pending.as_ref().map(|p| &p.device.id)
    }

    /// Start a fresh scan. Refused without touching the adapter unless the
    /// radio is powered on.
    pub fn start_scan(&mut self) -> Result<(), SessionError> {
        if !self.adapter_state.is_powered_on() {
            warn!("Scan refused, adapter is {}", self.adapter_state);
            return Err(SessionError::AdapterUnavailable(self.adapter_state));
        }
        if self.scan.is_some() {
            return Err(SessionError::ScanInProgress);
        }

        self.devices.clear();
        info!(
            "Starting BLE scan ({}s window, {} service filters)",
            self.config.scan_timeout.as_secs(),
            self.config.filter.service_uuids.len()
        );
        let results = self.adapter.scan(&self.config.filter);
        self.scan = Some(ActiveScan {
            results,
            deadline: Box::pin(tokio::time::sleep(self.config.scan_timeout)),
        });
        Ok(())
    }

    /// Stop the running scan. Returns whether one was running.
    pub fn stop_scan(&mut self) -> bool {
        match self.scan.take() {
            Some(_) => {
                info!("Stopping BLE scan...");
                self.adapter.stop_scan();
                true
            }
            None => false,
        }
    }

    /// Keep the first entry per id. Returns whether the device was new.
    pub fn record(&mut self, device: DiscoveredDevice) -> bool {
        if self.devices.iter().any(|d| d.id == device.id) {
            return false;
        }
        debug!("Discovered {} ({})", device.display_name(), device.id);
        self.devices.push(device);
        true
    }

    /// Begin connecting. Completion arrives through [`Self::next_event`].
    pub fn connect(&mut self, device: &DiscoveredDevice) -> Result<(), SessionError> {
        if let Some(pending) = &self.pending {
            return Err(SessionError::ConnectionInProgress(pending.device.id.clone()));
        }
        if !self.adapter_state.is_powered_on() {
            return Err(SessionError::AdapterUnavailable(self.adapter_state));
        }

        info!("Connecting to {} ({})", device.display_name(), device.id);
        let adapter = Arc::clone(&self.adapter);
        let id = device.id.clone();
        let attempt = async move {
            let connection = adapter.connect(&id).await?;
            if let Err(e) = adapter.discover_services_and_characteristics(&connection).await {
                // No half-open link may outlive a failed attempt.
                warn!("Discovery failed on {}, releasing link", id);
                if let Err(release) = adapter.disconnect(&id).await {
                    warn!("Failed to release {}: {}", id, release);
                }
                return Err(e);
            }
            Ok(())
        }
        .boxed();

        self.pending = Some(PendingConnect {
            device: device.clone(),
            attempt,
        });
        Ok(())
    }

    /// Wait for the next scan or connection outcome. Never resolves while
    /// nothing is in flight; duplicates are absorbed here.
    pub async fn next_event(&mut self) -> DiscoveryEvent {
        loop {
            let polled = {
                let (results, deadline) = match self.scan.as_mut() {
                    Some(ActiveScan { results, deadline }) => (Some(results), Some(deadline)),
                    None => (None, None),
                };
                let attempt = self.pending.as_mut().map(|p| &mut p.attempt);
                tokio::select! {
                    item = next_result(results) => Polled::Scan(item),
                    () = scan_deadline(deadline) => Polled::Deadline,
                    result = connect_attempt(attempt) => Polled::Connect(result),
                }
            };

            match polled {
                Polled::Scan(Some(Ok(device))) => {
                    if self.record(device.clone()) {
                        return DiscoveryEvent::Discovered(device);
                    }
                }
                Polled::Scan(Some(Err(e))) => {
                    error!("Scan error: {}", e);
                    self.stop_scan();
                    return DiscoveryEvent::ScanFailed(e);
                }
                Polled::Scan(None) => {
                    self.scan = None;
                    return DiscoveryEvent::ScanEnded;
                }
                Polled::Deadline => {
                    info!("Scan window elapsed");
                    self.stop_scan();
                    return DiscoveryEvent::ScanTimedOut;
                }
                Polled::Connect(result) => {
                    // The in-flight marker goes away whatever the outcome.
                    if let Some(pending) = self.pending.take() {
                        return self.finish_connect(pending.device, result);
                    }
                }
            }
        }
    }

    fn finish_connect(
        &mut self,
        device: DiscoveredDevice,
        result: Result<(), BleError>,
    ) -> DiscoveryEvent {
        match result {
            Ok(()) => {
                info!("Connected to {}", device.id);
                self.stop_scan();
                DiscoveryEvent::Connected(device)
            }
            Err(source) => {
                error!("Connection error: {}", source);
                let error = SessionError::Connection {
                    device: device.id.clone(),
                    source,
                };
                DiscoveryEvent::ConnectFailed { device, error }
            }
        }
    }
}

async fn next_result(
    results: Option<&mut ScanResults>,
) -> Option<Result<DiscoveredDevice, BleError>> {
    match results {
        Some(results) => results.next().await,
        None => std::future::pending().await,
    }
}

async fn scan_deadline(deadline: Option<&mut Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.await,
        None => std::future::pending().await,
    }
}

async fn connect_attempt(
    attempt: Option<&mut BoxFuture<'static, Result<(), BleError>>>,
) -> Result<(), BleError> {
    match attempt {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{AdapterCall, MockBleAdapter, MockPeripheral};

    fn controller(adapter: &Arc<MockBleAdapter>) -> DiscoveryController {
        let mut controller = DiscoveryController::new(adapter.clone(), DiscoveryConfig::default());
        controller.set_adapter_state(AdapterState::PoweredOn);
        controller
    }

    fn ids(controller: &DiscoveryController) -> Vec<&str> {
        controller.devices().iter().map(|d| d.id.as_str()).collect()
    }

    async fn connect_outcome(controller: &mut DiscoveryController) -> DiscoveryEvent {
        loop {
            match controller.next_event().await {
                DiscoveryEvent::Discovered(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_advertisements_keep_first_seen_order() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_peripheral(MockPeripheral::new(DiscoveredDevice::new("A")));
        adapter.add_peripheral(MockPeripheral::new(DiscoveredDevice::new("B")));
        let mut controller = controller(&adapter);

        controller.start_scan().unwrap();
        assert_eq!(
            controller.next_event().await,
            DiscoveryEvent::Discovered(DiscoveredDevice::new("A"))
        );
        assert_eq!(
            controller.next_event().await,
            DiscoveryEvent::Discovered(DiscoveredDevice::new("B"))
        );

        adapter.advertise(&DiscoveredDevice::new("A").with_signal_strength(-40));
        adapter.advertise(&DiscoveredDevice::new("B"));
        adapter.advertise(&DiscoveredDevice::new("C"));
        assert_eq!(
            controller.next_event().await,
            DiscoveryEvent::Discovered(DiscoveredDevice::new("C"))
        );

        assert_eq!(ids(&controller), vec!["A", "B", "C"]);
        // Later sightings do not update the stored entry.
        assert_eq!(controller.devices()[0].signal_strength, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_scan_clears_previous_devices() {
        let adapter = Arc::new(MockBleAdapter::new());
        let mut controller = controller(&adapter);
        controller.record(DiscoveredDevice::new("old"));

        controller.start_scan().unwrap();
        assert!(controller.devices().is_empty());
        assert!(controller.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_refused_when_radio_not_powered_on() {
        let adapter = Arc::new(MockBleAdapter::new());
        let mut controller = controller(&adapter);
        controller.record(DiscoveredDevice::new("kept"));
        controller.set_adapter_state(AdapterState::PoweredOff);

        assert_eq!(
            controller.start_scan(),
            Err(SessionError::AdapterUnavailable(AdapterState::PoweredOff))
        );
        assert!(adapter.calls().is_empty());
        assert!(!controller.is_scanning());
        assert_eq!(ids(&controller), vec!["kept"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_window() {
        let adapter = Arc::new(MockBleAdapter::with_sample_data());
        let mut controller = controller(&adapter);
        let started = tokio::time::Instant::now();

        controller.start_scan().unwrap();
        let mut discovered = 0;
        loop {
            match controller.next_event().await {
                DiscoveryEvent::Discovered(_) => discovered += 1,
                DiscoveryEvent::ScanTimedOut => break,
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(discovered, 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert!(!controller.is_scanning());
        assert!(!adapter.is_scanning());
        assert_eq!(adapter.calls().last(), Some(&AdapterCall::StopScan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_the_window() {
        let adapter = Arc::new(MockBleAdapter::new());
        let mut controller = controller(&adapter);

        controller.start_scan().unwrap();
        assert!(controller.stop_scan());
        assert!(!controller.stop_scan());

        let waited =
            tokio::time::timeout(Duration::from_secs(30), controller.next_event()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_error_returns_to_idle() {
        let adapter = Arc::new(MockBleAdapter::new());
        let mut controller = controller(&adapter);

        controller.start_scan().unwrap();
        adapter.fail_scan(BleError::ScanFailed("radio reset".to_string()));

        assert_eq!(
            controller.next_event().await,
            DiscoveryEvent::ScanFailed(BleError::ScanFailed("radio reset".to_string()))
        );
        assert!(!controller.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_stops_scan() {
        let adapter = Arc::new(MockBleAdapter::with_sample_data());
        let mut controller = controller(&adapter);
        controller.start_scan().unwrap();
        let sensor = match controller.next_event().await {
            DiscoveryEvent::Discovered(device) => device,
            other => panic!("unexpected event {other:?}"),
        };

        controller.connect(&sensor).unwrap();
        assert_eq!(controller.connecting(), Some(&sensor.id));

        assert_eq!(
            connect_outcome(&mut controller).await,
            DiscoveryEvent::Connected(sensor.clone())
        );
        assert_eq!(controller.connecting(), None);
        assert!(!controller.is_scanning());
        assert!(adapter.is_connected(&sensor.id));
        assert!(adapter
            .calls()
            .contains(&AdapterCall::DiscoverServices(sensor.id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_clears_marker() {
        let adapter = Arc::new(MockBleAdapter::new());
        let device = DiscoveredDevice::new("far").with_name("Faraway");
        adapter.add_peripheral(MockPeripheral::new(device.clone()).unreachable());
        let mut controller = controller(&adapter);

        controller.connect(&device).unwrap();
        match connect_outcome(&mut controller).await {
            DiscoveryEvent::ConnectFailed { device: failed, error } => {
                assert_eq!(failed, device);
                assert!(matches!(error, SessionError::Connection { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(controller.connecting(), None);
        assert!(!adapter.is_connected(&device.id));

        // A manual retry is allowed once the attempt is over.
        assert!(controller.connect(&device).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_connection_attempt_in_flight() {
        let adapter = Arc::new(MockBleAdapter::with_sample_data());
        let mut controller = controller(&adapter);
        let first = DiscoveredDevice::new("D4:36:39:6F:A1:02");
        let second = DiscoveredDevice::new("5C:F3:70:0B:11:9E");

        controller.connect(&first).unwrap();
        assert_eq!(
            controller.connect(&second),
            Err(SessionError::ConnectionInProgress(first.id.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused_when_radio_off() {
        let adapter = Arc::new(MockBleAdapter::with_sample_data());
        let mut controller = controller(&adapter);
        controller.set_adapter_state(AdapterState::Unauthorized);

        let device = DiscoveredDevice::new("D4:36:39:6F:A1:02");
        assert_eq!(
            controller.connect(&device),
            Err(SessionError::AdapterUnavailable(AdapterState::Unauthorized))
        );
        assert_eq!(controller.connecting(), None);
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_releases_link() {
        let adapter = Arc::new(MockBleAdapter::with_sample_data());
        let mut controller = controller(&adapter);
        let first = DiscoveredDevice::new("D4:36:39:6F:A1:02");
        let second = DiscoveredDevice::new("5C:F3:70:0B:11:9E");

        adapter.set_fail_discovery(true);
        controller.connect(&first).unwrap();
        match connect_outcome(&mut controller).await {
            DiscoveryEvent::ConnectFailed { error, .. } => assert!(matches!(
                error,
                SessionError::Connection {
                    source: BleError::ServiceDiscoveryFailed(_),
                    ..
                }
            )),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!adapter.is_connected(&first.id));
        assert!(adapter
            .calls()
            .contains(&AdapterCall::Disconnect(first.id.clone())));

        adapter.set_fail_discovery(false);
        controller.connect(&second).unwrap();
        assert_eq!(
            connect_outcome(&mut controller).await,
            DiscoveryEvent::Connected(second.clone())
        );
        assert!(!adapter.is_connected(&first.id));
        assert!(adapter.is_connected(&second.id));
    }
}
