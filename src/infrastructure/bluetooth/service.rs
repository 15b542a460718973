//! Bluetooth Service Module
//!
//! Main service that owns the adapter and both controllers, turns UI
//! commands into controller calls, and reports every outcome back as
//! [`AppEvent`]s.

use crate::domain::models::{
    AdapterState, AppEvent, BluetoothCommand, DeviceId, Notice, NoticeSeverity,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::discovery::{
    DiscoveryConfig, DiscoveryController, DiscoveryEvent,
};
use crate::infrastructure::bluetooth::error::{BleError, SessionError};
use crate::infrastructure::bluetooth::streaming::{
    SessionEvent, StreamingController, StreamingOutcome,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    adapter: Arc<dyn BleAdapter>,
    discovery: DiscoveryController,
    streaming: StreamingController,
    adapter_state: watch::Receiver<AdapterState>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let config = DiscoveryConfig {
            scan_timeout: settings.scan_timeout(),
            filter: settings.scan_filter(),
        };
        Self {
            discovery: DiscoveryController::new(Arc::clone(&adapter), config),
            streaming: StreamingController::new(Arc::clone(&adapter), settings.sample_capacity),
            adapter_state: adapter.observe_state(),
            adapter,
            event_sender,
        }
    }

    /// Process commands and adapter events until `Shutdown` arrives or the
    /// command channel closes, then release the adapter.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BluetoothCommand>) {
        let initial = *self.adapter_state.borrow_and_update();
        self.apply_adapter_state(initial);

        let mut state_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(BluetoothCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                changed = self.adapter_state.changed(), if state_open => {
                    if changed.is_ok() {
                        let state = *self.adapter_state.borrow_and_update();
                        self.apply_adapter_state(state);
                    } else {
                        warn!("Adapter state feed closed");
                        state_open = false;
                    }
                }
                event = self.discovery.next_event() => self.handle_discovery_event(event),
                event = self.streaming.next_event() => self.handle_session_event(event).await,
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!("Shutting down Bluetooth service");
        self.discovery.stop_scan();
        self.streaming.stop_streaming();
        self.adapter.destroy();
    }

    fn apply_adapter_state(&mut self, state: AdapterState) {
        self.discovery.set_adapter_state(state);
        self.send(AppEvent::AdapterState(state));
    }

    pub async fn handle_command(&mut self, command: BluetoothCommand) {
        debug!("Command: {:?}", command);
        let result = match command {
            BluetoothCommand::StartScan => self.start_scan(),
            BluetoothCommand::StopScan => {
                if self.discovery.stop_scan() {
                    self.send(AppEvent::Scanning(false));
                }
                Ok(())
            }
            BluetoothCommand::Connect(id) => self.connect(&id),
            BluetoothCommand::StartStreaming => self.start_streaming().await,
            BluetoothCommand::StopStreaming => {
                self.stop_streaming();
                Ok(())
            }
            BluetoothCommand::Disconnect => self.disconnect().await,
            BluetoothCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = result {
            self.send(AppEvent::Notice(e.notice()));
        }
    }

    fn start_scan(&mut self) -> Result<(), SessionError> {
        self.discovery.start_scan()?;
        self.send(AppEvent::DevicesCleared);
        self.send(AppEvent::Scanning(true));
        Ok(())
    }

    fn connect(&mut self, id: &DeviceId) -> Result<(), SessionError> {
        if let Some(active) = self.streaming.device() {
            return Err(SessionError::AlreadyConnected(active.id.clone()));
        }
        let device = self
            .discovery
            .find(id)
            .cloned()
            .ok_or_else(|| SessionError::Connection {
                device: id.clone(),
                source: BleError::DeviceNotFound(id.clone()),
            })?;

        self.discovery.connect(&device)?;
        self.send(AppEvent::Connecting(Some(device.id)));
        Ok(())
    }

    async fn start_streaming(&mut self) -> Result<(), SessionError> {
        match self.streaming.start_streaming().await? {
            StreamingOutcome::Started(count) => {
                self.send(AppEvent::SamplesCleared);
                self.send(AppEvent::Streaming(true));
                self.notify(Notice::toast(
                    NoticeSeverity::Success,
                    "Streaming Started",
                    format!("Monitoring {} notifiable characteristics", count),
                ));
            }
            StreamingOutcome::NothingToStream => {
                self.notify(Notice::toast(
                    NoticeSeverity::Info,
                    "No Streaming Available",
                    "This device has no notifiable characteristics",
                ));
            }
        }
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if self.streaming.stop_streaming() {
            self.send(AppEvent::Streaming(false));
            self.notify(Notice::toast(
                NoticeSeverity::Info,
                "Streaming Stopped",
                "Data streaming has been stopped",
            ));
        }
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.streaming.device().is_none() {
            return Err(SessionError::NotConnected);
        }
        self.stop_streaming();

        self.streaming.disconnect().await?;
        self.send(AppEvent::SamplesCleared);
        self.send(AppEvent::Disconnected);
        self.notify(Notice::toast(
            NoticeSeverity::Success,
            "Disconnected",
            "Device disconnected successfully",
        ));
        Ok(())
    }

    fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered(device) => self.send(AppEvent::DeviceFound(device)),
            DiscoveryEvent::ScanFailed(e) => {
                self.send(AppEvent::Scanning(false));
                self.notify(SessionError::Scan(e).notice());
            }
            DiscoveryEvent::ScanTimedOut | DiscoveryEvent::ScanEnded => {
                self.send(AppEvent::Scanning(false));
            }
            DiscoveryEvent::Connected(device) => {
                self.send(AppEvent::Connecting(None));
                self.send(AppEvent::Scanning(false));
                self.streaming.attach(device.clone());
                self.notify(Notice::dialog(
                    NoticeSeverity::Success,
                    "Success",
                    format!("Connected to {}", device.display_name()),
                ));
                self.send(AppEvent::Connected(device));
            }
            DiscoveryEvent::ConnectFailed { device, error } => {
                error!("Connection to {} failed: {}", device.id, error);
                self.send(AppEvent::Connecting(None));
                self.notify(error.notice());
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Sample(sample) => self.send(AppEvent::Sample(sample)),
            SessionEvent::DeviceLost(device) => {
                info!("Device disconnected: {}", device.id);
                // The platform may still hold the link open and revive it.
                if let Err(e) = self.adapter.disconnect(&device.id).await {
                    warn!("Failed to release {}: {}", device.id, e);
                }
                self.send(AppEvent::Streaming(false));
                self.send(AppEvent::SamplesCleared);
                self.send(AppEvent::Disconnected);
                self.notify(Notice::toast(
                    NoticeSeverity::Warning,
                    "Disconnected",
                    format!("{} disconnected", device.display_name()),
                ));
            }
            SessionEvent::WatchFailed(e) => {
                warn!("Disconnection watch failed: {}", e);
            }
        }
    }

    fn notify(&self, notice: Notice) {
        self.send(AppEvent::Notice(notice));
    }

    fn send(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DiscoveredDevice, NoticeStyle};
    use crate::infrastructure::bluetooth::mock::{AdapterCall, MockBleAdapter, MockPeripheral};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        adapter: Arc<MockBleAdapter>,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(adapter: MockBleAdapter) -> Self {
            let adapter = Arc::new(adapter);
            let (event_tx, events) = mpsc::unbounded_channel();
            let (commands, command_rx) = mpsc::unbounded_channel();
            let service = BluetoothService::new(adapter.clone(), &Settings::default(), event_tx);
            let task = tokio::spawn(service.run(command_rx));
            Self {
                adapter,
                commands,
                events,
                task,
            }
        }

        fn send(&self, command: BluetoothCommand) {
            self.commands.send(command).unwrap();
        }

        async fn expect(&mut self, mut wanted: impl FnMut(&AppEvent) -> bool) -> AppEvent {
            let wait = async {
                loop {
                    let event = self.events.recv().await.expect("service stopped");
                    if wanted(&event) {
                        return event;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(60), wait)
                .await
                .expect("event not received")
        }

        async fn shutdown(self) -> Arc<MockBleAdapter> {
            self.send(BluetoothCommand::Shutdown);
            self.task.await.unwrap();
            self.adapter
        }
    }

    fn sensor_adapter() -> MockBleAdapter {
        let adapter = MockBleAdapter::new();
        adapter.add_peripheral(
            MockPeripheral::new(DiscoveredDevice::new("X").with_name("Sensor1"))
                .with_service("S1", &[("C1", true)])
                .with_service("S2", &[("C2", true), ("R2", false)]),
        );
        adapter
    }

    async fn connect_sensor(harness: &mut Harness) {
        harness.expect(|e| matches!(e, AppEvent::AdapterState(_))).await;
        harness.send(BluetoothCommand::StartScan);
        harness
            .expect(|e| matches!(e, AppEvent::DeviceFound(d) if d.id.as_str() == "X"))
            .await;
        harness.send(BluetoothCommand::Connect(DeviceId::new("X")));
        harness
            .expect(|e| matches!(e, AppEvent::Connected(_)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connect_stream_disconnect() {
        let mut harness = Harness::start(sensor_adapter());
        connect_sensor(&mut harness).await;

        harness.send(BluetoothCommand::StartStreaming);
        harness
            .expect(|e| matches!(e, AppEvent::Streaming(true)))
            .await;
        let started = harness
            .expect(|e| matches!(e, AppEvent::Notice(_)))
            .await;
        match started {
            AppEvent::Notice(notice) => {
                assert_eq!(notice.body, "Monitoring 2 notifiable characteristics")
            }
            other => panic!("unexpected event {other:?}"),
        }

        let id = DeviceId::new("X");
        for n in 1..=3u8 {
            harness.adapter.notify(&id, "S1", "C1", &[n]);
        }
        let mut received = Vec::new();
        for _ in 0..3 {
            if let AppEvent::Sample(sample) = harness
                .expect(|e| matches!(e, AppEvent::Sample(_)))
                .await
            {
                received.push(sample.raw_value);
            }
        }
        assert_eq!(received, vec!["AQ==", "Ag==", "Aw=="]);

        harness.send(BluetoothCommand::Disconnect);
        harness
            .expect(|e| matches!(e, AppEvent::Disconnected))
            .await;
        assert!(!harness.adapter.is_connected(&id));

        let adapter = harness.shutdown().await;
        assert_eq!(adapter.calls().last(), Some(&AdapterCall::Destroy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_refused_with_radio_off() {
        let adapter = sensor_adapter();
        adapter.set_state(AdapterState::PoweredOff);
        let mut harness = Harness::start(adapter);

        harness
            .expect(|e| matches!(e, AppEvent::AdapterState(AdapterState::PoweredOff)))
            .await;
        harness.send(BluetoothCommand::StartScan);
        match harness.expect(|e| matches!(e, AppEvent::Notice(_))).await {
            AppEvent::Notice(notice) => {
                assert_eq!(notice.title, "Bluetooth Error");
                assert_eq!(notice.style, NoticeStyle::Dialog);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let adapter = harness.shutdown().await;
        assert!(!adapter.calls().contains(&AdapterCall::Scan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_state_changes_are_forwarded() {
        let mut harness = Harness::start(sensor_adapter());
        harness
            .expect(|e| matches!(e, AppEvent::AdapterState(AdapterState::PoweredOn)))
            .await;

        harness.adapter.set_state(AdapterState::Resetting);
        harness
            .expect(|e| matches!(e, AppEvent::AdapterState(AdapterState::Resetting)))
            .await;
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_window_reported_as_stopped() {
        let mut harness = Harness::start(sensor_adapter());
        harness.expect(|e| matches!(e, AppEvent::AdapterState(_))).await;
        harness.send(BluetoothCommand::StartScan);
        harness
            .expect(|e| matches!(e, AppEvent::Scanning(true)))
            .await;
        harness
            .expect(|e| matches!(e, AppEvent::Scanning(false)))
            .await;
        assert!(!harness.adapter.is_scanning());
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_returns_to_discovery() {
        let mut harness = Harness::start(sensor_adapter());
        connect_sensor(&mut harness).await;
        harness.send(BluetoothCommand::StartStreaming);
        harness
            .expect(|e| matches!(e, AppEvent::Streaming(true)))
            .await;

        let id = DeviceId::new("X");
        harness.adapter.clear_calls();
        harness.adapter.drop_link(&id);
        harness
            .expect(|e| matches!(e, AppEvent::SamplesCleared))
            .await;
        harness
            .expect(|e| matches!(e, AppEvent::Disconnected))
            .await;
        assert!(harness
            .adapter
            .calls()
            .contains(&AdapterCall::Disconnect(id.clone())));

        // A new connection is possible again.
        harness.send(BluetoothCommand::StartScan);
        harness
            .expect(|e| matches!(e, AppEvent::DeviceFound(_)))
            .await;
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_rejected() {
        let mut harness = Harness::start(sensor_adapter());
        connect_sensor(&mut harness).await;

        harness.send(BluetoothCommand::Connect(DeviceId::new("X")));
        match harness
            .expect(|e| matches!(e, AppEvent::Notice(n) if n.title == "Connection"))
            .await
        {
            AppEvent::Notice(notice) => assert!(notice.body.contains("Already connected")),
            other => panic!("unexpected event {other:?}"),
        }

        let adapter = harness.shutdown().await;
        let connects = adapter
            .calls()
            .iter()
            .filter(|c| matches!(c, AdapterCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }
}
