//! Streaming Session
//!
//! Owns the connected device. Subscribes to every notifiable characteristic,
//! keeps the newest samples, and tears everything down when the device goes
//! away.

use crate::domain::models::{DeviceId, DiscoveredDevice, StreamSample};
use crate::domain::session::{SampleBuffer, SessionState};
use crate::infrastructure::bluetooth::adapter::{BleAdapter, DisconnectionWatch};
use crate::infrastructure::bluetooth::error::{BleError, SessionError};
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, trace, warn};

/// Transaction tag shared by every streaming subscription.
pub const STREAM_TRANSACTION: &str = "stream";

/// A value pushed by the peripheral, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub service_id: String,
    pub characteristic_id: String,
    pub value: Result<String, BleError>,
}

/// All live subscriptions merged. Per-channel order is kept; channels
/// interleave freely.
pub type Subscriptions = SelectAll<BoxStream<'static, Notification>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingOutcome {
    /// Number of characteristics now being monitored.
    Started(usize),
    NothingToStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Sample(StreamSample),
    /// The adapter reported the device gone; the session is now Disconnected.
    DeviceLost(DiscoveredDevice),
    WatchFailed(BleError),
}

enum Polled {
    Notification(Notification),
    Disconnection(Result<DeviceId, BleError>),
}

pub struct StreamingController {
    adapter: Arc<dyn BleAdapter>,
    state: SessionState<Subscriptions>,
    sample_capacity: usize,
    disconnect_watch: Option<DisconnectionWatch>,
}

impl StreamingController {
    pub fn new(adapter: Arc<dyn BleAdapter>, sample_capacity: usize) -> Self {
        Self {
            adapter,
            state: SessionState::Disconnected,
            sample_capacity,
            disconnect_watch: None,
        }
    }

    pub fn state(&self) -> &SessionState<Subscriptions> {
        &self.state
    }

    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.state.device()
    }

    pub fn samples(&self) -> Option<&SampleBuffer> {
        self.state.samples()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    /// Take ownership of a freshly connected device and watch for its
    /// disconnection.
    pub fn attach(&mut self, device: DiscoveredDevice) {
        info!("Session attached to {} ({})", device.display_name(), device.id);
        self.disconnect_watch = Some(self.adapter.observe_disconnection(&device.id));
        self.state = SessionState::Connected {
            device,
            samples: SampleBuffer::new(self.sample_capacity),
        };
    }

    /// Subscribe to every notifiable characteristic of the device.
    pub async fn start_streaming(&mut self) -> Result<StreamingOutcome, SessionError> {
        let device = match &self.state {
            SessionState::Disconnected => return Err(SessionError::NotConnected),
            SessionState::Streaming { .. } => return Err(SessionError::AlreadyStreaming),
            SessionState::Connected { device, .. } => device.id.clone(),
        };

        let subscriptions = match Self::subscribe_all(Arc::clone(&self.adapter), &device).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!("Error streaming data: {}", e);
                self.adapter.cancel_transactions(STREAM_TRANSACTION);
                return Err(SessionError::StreamingSetup(e));
            }
        };

        if subscriptions.is_empty() {
            info!("{} has no notifiable characteristics", device);
            return Ok(StreamingOutcome::NothingToStream);
        }

        let count = subscriptions.len();
        self.state = match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Connected { device, mut samples } => {
                samples.clear();
                SessionState::Streaming {
                    device,
                    samples,
                    subscriptions,
                }
            }
            other => other,
        };
        info!("Monitoring {} notifiable characteristics", count);
        Ok(StreamingOutcome::Started(count))
    }

    // Owns its adapter handle: the future must not borrow the controller.
    async fn subscribe_all(
        adapter: Arc<dyn BleAdapter>,
        device: &DeviceId,
    ) -> Result<Subscriptions, BleError> {
        let mut subscriptions = SelectAll::new();

        let services = adapter.services(device).await?;
        debug!(
            "Available services: {:?}",
            services.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
        );

        for service in &services {
            let characteristics = adapter.characteristics(device, service).await?;
            for c in &characteristics {
                debug!(
                    "Service {} characteristic {}: notify={} read={} write={} write_no_rsp={}",
                    service.id,
                    c.id,
                    c.is_notifiable,
                    c.is_readable,
                    c.is_writable_with_response,
                    c.is_writable_without_response
                );
            }

            for characteristic in characteristics.iter().filter(|c| c.is_notifiable) {
                info!("Setting up streaming for: {}", characteristic.id);
                let values = adapter
                    .subscribe(device, &service.id, &characteristic.id, STREAM_TRANSACTION)
                    .await?;

                let service_id = service.id.clone();
                let characteristic_id = characteristic.id.clone();
                subscriptions.push(
                    values
                        .map(move |value| Notification {
                            service_id: service_id.clone(),
                            characteristic_id: characteristic_id.clone(),
                            value,
                        })
                        .boxed(),
                );
            }
        }

        Ok(subscriptions)
    }

    /// Cancel all subscriptions, keeping the sample history. Returns whether
    /// streaming was active.
    pub fn stop_streaming(&mut self) -> bool {
        match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Streaming {
                device,
                samples,
                subscriptions,
            } => {
                info!("Stopping data streaming...");
                self.adapter.cancel_transactions(STREAM_TRANSACTION);
                drop(subscriptions);
                self.state = SessionState::Connected { device, samples };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Release the connection. On failure the device stays connected so the
    /// user can retry; streaming is stopped either way.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        let device = self
            .state
            .device()
            .map(|d| d.id.clone())
            .ok_or(SessionError::NotConnected)?;

        self.stop_streaming();

        match self.adapter.disconnect(&device).await {
            Ok(()) => {
                info!("Disconnected from {}", device);
                self.disconnect_watch = None;
                self.state = SessionState::Disconnected;
                Ok(())
            }
            Err(e) => {
                error!("Error disconnecting {}: {}", device, e);
                Err(SessionError::Disconnect(e))
            }
        }
    }

    /// Record a notification. Deliveries outside Streaming are dropped.
    pub fn handle_notification(&mut self, notification: Notification) -> Option<StreamSample> {
        let SessionState::Streaming { samples, .. } = &mut self.state else {
            trace!(
                "Dropping late notification from {}",
                notification.characteristic_id
            );
            return None;
        };

        match notification.value {
            Ok(raw_value) if !raw_value.is_empty() => {
                trace!(
                    "Streamed data from {}: {}",
                    notification.characteristic_id,
                    raw_value
                );
                let sample = StreamSample {
                    characteristic_id: notification.characteristic_id,
                    service_id: notification.service_id,
                    raw_value,
                    captured_at: SystemTime::now(),
                };
                samples.push(sample.clone());
                Some(sample)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(
                    "Notification error on {}: {}",
                    notification.characteristic_id, e
                );
                None
            }
        }
    }

    /// Apply the result of the disconnection watch. The watch is single-fire
    /// and is not re-armed.
    pub fn handle_disconnection(
        &mut self,
        result: Result<DeviceId, BleError>,
    ) -> Option<SessionEvent> {
        self.disconnect_watch = None;
        match result {
            Ok(id) => {
                if self.state.device().map(|d| &d.id) != Some(&id) {
                    debug!("Ignoring disconnection of inactive device {}", id);
                    return None;
                }
                match std::mem::replace(&mut self.state, SessionState::Disconnected) {
                    SessionState::Streaming { device, .. } => {
                        warn!("Device disconnected, stopping stream");
                        Some(SessionEvent::DeviceLost(device))
                    }
                    SessionState::Connected { device, .. } => {
                        warn!("Device disconnected: {}", device.id);
                        Some(SessionEvent::DeviceLost(device))
                    }
                    SessionState::Disconnected => None,
                }
            }
            Err(e) => {
                error!("Device disconnection error: {}", e);
                Some(SessionEvent::WatchFailed(e))
            }
        }
    }

    /// Wait for the next sample or disconnection. Never resolves while there
    /// is nothing to wait for.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            let polled = {
                let subscriptions = match &mut self.state {
                    SessionState::Streaming { subscriptions, .. } if !subscriptions.is_empty() => {
                        Some(subscriptions)
                    }
                    _ => None,
                };
                let watch = self.disconnect_watch.as_mut();
                tokio::select! {
                    Some(notification) = next_notification(subscriptions) => Polled::Notification(notification),
                    result = disconnection(watch) => Polled::Disconnection(result),
                }
            };

            let event = match polled {
                Polled::Notification(notification) => {
                    self.handle_notification(notification).map(SessionEvent::Sample)
                }
                Polled::Disconnection(result) => self.handle_disconnection(result),
            };
            if let Some(event) = event {
                return event;
            }
        }
    }
}

async fn next_notification(subscriptions: Option<&mut Subscriptions>) -> Option<Notification> {
    match subscriptions {
        Some(subscriptions) => subscriptions.next().await,
        None => std::future::pending().await,
    }
}

async fn disconnection(watch: Option<&mut DisconnectionWatch>) -> Result<DeviceId, BleError> {
    match watch {
        Some(watch) => watch.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{AdapterCall, MockBleAdapter, MockPeripheral};
    use std::time::Duration;

    fn sensor() -> DiscoveredDevice {
        DiscoveredDevice::new("X").with_name("Sensor1")
    }

    async fn connected(peripheral: MockPeripheral) -> (Arc<MockBleAdapter>, StreamingController) {
        let adapter = Arc::new(MockBleAdapter::new());
        let device = peripheral.device.clone();
        adapter.add_peripheral(peripheral);

        let connection = adapter.connect(&device.id).await.unwrap();
        adapter
            .discover_services_and_characteristics(&connection)
            .await
            .unwrap();

        let mut controller = StreamingController::new(adapter.clone(), 100);
        controller.attach(device);
        (adapter, controller)
    }

    fn two_channel_sensor() -> MockPeripheral {
        MockPeripheral::new(sensor())
            .with_service("S1", &[("C1", true), ("R1", false)])
            .with_service("S2", &[("C2", true)])
    }

    fn values(controller: &StreamingController) -> Vec<String> {
        controller
            .samples()
            .map(|s| s.iter().map(|sample| sample.raw_value.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_scenario() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");

        assert_eq!(
            controller.start_streaming().await,
            Ok(StreamingOutcome::Started(2))
        );
        assert!(controller.is_streaming());

        for n in 1..=3u8 {
            assert_eq!(adapter.notify(&id, "S1", "C1", &[n]), 1);
        }
        for _ in 0..3 {
            match controller.next_event().await {
                SessionEvent::Sample(sample) => {
                    assert_eq!(sample.characteristic_id, "C1");
                    assert_eq!(sample.service_id, "S1");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(values(&controller), vec!["Aw==", "Ag==", "AQ=="]);

        controller.disconnect().await.unwrap();
        assert!(controller.samples().is_none());
        assert!(controller.device().is_none());
        assert!(!controller.is_streaming());
        assert!(!adapter.is_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_stream() {
        let peripheral =
            MockPeripheral::new(sensor()).with_service("S1", &[("R1", false), ("R2", false)]);
        let (adapter, mut controller) = connected(peripheral).await;

        assert_eq!(
            controller.start_streaming().await,
            Ok(StreamingOutcome::NothingToStream)
        );
        assert!(!controller.is_streaming());
        assert!(controller.device().is_some());
        assert_eq!(adapter.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_never_exceeds_capacity() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");
        controller.start_streaming().await.unwrap();

        for n in 0..150u16 {
            adapter.notify(&id, "S2", "C2", &n.to_le_bytes());
            let event = controller.next_event().await;
            assert!(matches!(event, SessionEvent::Sample(_)));
        }

        let samples = controller.samples().unwrap();
        assert_eq!(samples.len(), 100);
        assert_eq!(
            samples.newest().map(|s| s.raw_value.as_str()),
            Some("lQA=") // 149
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_disconnection_while_streaming() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");
        controller.start_streaming().await.unwrap();
        adapter.notify(&id, "S1", "C1", &[7]);
        assert!(matches!(
            controller.next_event().await,
            SessionEvent::Sample(_)
        ));

        adapter.drop_link(&id);
        assert_eq!(
            controller.next_event().await,
            SessionEvent::DeviceLost(sensor())
        );
        assert!(!controller.is_streaming());
        assert!(controller.device().is_none());
        assert!(controller.samples().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnection_without_streaming() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;

        adapter.drop_link(&DeviceId::new("X"));
        assert_eq!(
            controller.next_event().await,
            SessionEvent::DeviceLost(sensor())
        );
        assert!(controller.device().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_notification_after_stop_is_discarded() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");
        controller.start_streaming().await.unwrap();
        adapter.notify(&id, "S1", "C1", &[1]);
        controller.next_event().await;

        assert!(controller.stop_streaming());
        assert!(adapter
            .calls()
            .contains(&AdapterCall::CancelTransactions(STREAM_TRANSACTION.to_string())));

        let late = Notification {
            service_id: "S1".to_string(),
            characteristic_id: "C1".to_string(),
            value: Ok("Ag==".to_string()),
        };
        assert_eq!(controller.handle_notification(late), None);
        assert_eq!(adapter.notify(&id, "S1", "C1", &[3]), 0);

        let waited = tokio::time::timeout(Duration::from_secs(5), controller.next_event()).await;
        assert!(waited.is_err());

        // History survives the stop.
        assert_eq!(values(&controller), vec!["AQ=="]);
        assert!(!controller.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_history() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");
        controller.start_streaming().await.unwrap();
        adapter.notify(&id, "S1", "C1", &[1]);
        controller.next_event().await;
        controller.stop_streaming();

        controller.start_streaming().await.unwrap();
        assert_eq!(controller.samples().map(SampleBuffer::len), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_errors_are_ignored() {
        let (_adapter, mut controller) = connected(two_channel_sensor()).await;
        controller.start_streaming().await.unwrap();

        let failed = Notification {
            service_id: "S1".to_string(),
            characteristic_id: "C1".to_string(),
            value: Err(BleError::Notification("decode".to_string())),
        };
        assert_eq!(controller.handle_notification(failed), None);
        assert_eq!(controller.samples().map(SampleBuffer::len), Some(0));
        assert!(controller.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_does_not_enter_streaming() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        adapter.set_fail_subscribe(true);

        assert!(matches!(
            controller.start_streaming().await,
            Err(SessionError::StreamingSetup(BleError::SubscriptionFailed(_)))
        ));
        assert!(!controller.is_streaming());
        assert!(controller.device().is_some());
        assert_eq!(adapter.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions() {
        let adapter = Arc::new(MockBleAdapter::new());
        let mut controller = StreamingController::new(adapter, 100);
        assert_eq!(
            controller.start_streaming().await,
            Err(SessionError::NotConnected)
        );
        assert_eq!(controller.disconnect().await, Err(SessionError::NotConnected));

        let (_adapter, mut controller) = connected(two_channel_sensor()).await;
        controller.start_streaming().await.unwrap();
        assert_eq!(
            controller.start_streaming().await,
            Err(SessionError::AlreadyStreaming)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_release_keeps_device() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        controller.start_streaming().await.unwrap();
        adapter.set_fail_disconnect(true);

        assert!(matches!(
            controller.disconnect().await,
            Err(SessionError::Disconnect(_))
        ));
        assert!(!controller.is_streaming());
        assert_eq!(controller.device(), Some(&sensor()));

        adapter.set_fail_disconnect(false);
        assert_eq!(controller.disconnect().await, Ok(()));
        assert!(controller.device().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_failure_keeps_session() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        let id = DeviceId::new("X");

        adapter.fail_disconnection_watch(&id, BleError::InvalidDeviceId);
        assert_eq!(
            controller.next_event().await,
            SessionEvent::WatchFailed(BleError::InvalidDeviceId)
        );
        assert!(controller.device().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_enumeration_failure_does_not_enter_streaming() {
        let (adapter, mut controller) = connected(two_channel_sensor()).await;
        adapter.clear_calls();
        adapter.set_fail_services(true);

        assert!(matches!(
            controller.start_streaming().await,
            Err(SessionError::StreamingSetup(BleError::ServiceDiscoveryFailed(_)))
        ));
        assert!(!controller.is_streaming());
        assert_eq!(controller.device(), Some(&sensor()));
        assert!(!adapter
            .calls()
            .iter()
            .any(|c| matches!(c, AdapterCall::Subscribe { .. })));

        adapter.set_fail_services(false);
        assert_eq!(
            controller.start_streaming().await,
            Ok(StreamingOutcome::Started(2))
        );
    }

    #[test]
    fn test_start_streaming_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let adapter: Arc<dyn BleAdapter> = Arc::new(MockBleAdapter::new());
        let mut controller = StreamingController::new(adapter, 100);
        assert_send(controller.start_streaming());
    }
}
