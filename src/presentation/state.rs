//! UI-side mirror of the Bluetooth worker's state, rebuilt from `AppEvent`s.

use ble_stream_monitor::domain::models::{
    AdapterState, AppEvent, DeviceId, DiscoveredDevice, Notice, NoticeStyle,
};
use ble_stream_monitor::domain::session::{select_view, SampleBuffer, View};
use std::time::{Duration, Instant};

const TOAST_DURATION: Duration = Duration::from_secs(4);

pub struct MonitorState {
    pub adapter_state: AdapterState,
    pub is_scanning: bool,
    pub devices: Vec<DiscoveredDevice>,
    pub connecting: Option<DeviceId>,
    pub connected: Option<DiscoveredDevice>,
    pub is_streaming: bool,
    pub samples: SampleBuffer,
    pub toast: Option<(Notice, Instant)>,
    pub dialog: Option<Notice>,
}

impl MonitorState {
    pub fn new(sample_capacity: usize) -> Self {
        Self {
            adapter_state: AdapterState::Unknown,
            is_scanning: false,
            devices: Vec::new(),
            connecting: None,
            connected: None,
            is_streaming: false,
            samples: SampleBuffer::new(sample_capacity),
            toast: None,
            dialog: None,
        }
    }

    pub fn view(&self) -> View {
        select_view(self.adapter_state, self.connected.is_some())
    }

    /// Name shown while a connection attempt is in flight.
    pub fn connecting_label(&self) -> Option<String> {
        let target = self.connecting.as_ref()?;
        let label = self
            .devices
            .iter()
            .find(|d| d.id == *target)
            .map(|d| d.display_name().to_string())
            .unwrap_or_else(|| target.to_string());
        Some(label)
    }

    pub fn can_scan(&self) -> bool {
        !self.is_scanning && self.adapter_state.is_powered_on()
    }

    pub fn apply(&mut self, event: AppEvent) {
        match event {
            AppEvent::AdapterState(state) => self.adapter_state = state,
            AppEvent::Scanning(active) => self.is_scanning = active,
            AppEvent::DevicesCleared => self.devices.clear(),
            AppEvent::DeviceFound(device) => {
                if !self.devices.iter().any(|d| d.id == device.id) {
                    self.devices.push(device);
                }
            }
            AppEvent::Connecting(target) => self.connecting = target,
            AppEvent::Connected(device) => {
                self.connecting = None;
                self.connected = Some(device);
            }
            AppEvent::Disconnected => {
                self.connected = None;
                self.is_streaming = false;
                self.samples.clear();
            }
            AppEvent::Streaming(active) => self.is_streaming = active,
            AppEvent::Sample(sample) => self.samples.push(sample),
            AppEvent::SamplesCleared => self.samples.clear(),
            AppEvent::Notice(notice) => match notice.style {
                NoticeStyle::Dialog => self.dialog = Some(notice),
                NoticeStyle::Toast => self.toast = Some((notice, Instant::now())),
            },
        }
    }

    /// Drop the toast once it has been shown long enough.
    pub fn expire_toast(&mut self, now: Instant) {
        if let Some((_, shown_at)) = &self.toast {
            if now.duration_since(*shown_at) >= TOAST_DURATION {
                self.toast = None;
            }
        }
    }
}
