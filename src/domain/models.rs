use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Power/availability state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }

    /// States in which the app cannot do anything useful until the user
    /// changes something outside of it.
    pub fn is_blocking(self) -> bool {
        matches!(self, AdapterState::Unsupported | AdapterState::Unauthorized)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AdapterState::Unknown => "Unknown",
            AdapterState::Resetting => "Resetting",
            AdapterState::Unsupported => "Unsupported",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::PoweredOff => "PoweredOff",
            AdapterState::PoweredOn => "PoweredOn",
        };
        f.write_str(label)
    }
}

/// Opaque, stable peripheral identifier as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub signal_strength: Option<i16>,
    pub is_connectable: Option<bool>,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            signal_strength: None,
            is_connectable: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_signal_strength(mut self, rssi: i16) -> Self {
        self.signal_strength = Some(rssi);
        self
    }

    /// Name shown to the user, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CharacteristicDescriptor {
    pub id: String,
    pub service_id: String,
    pub is_notifiable: bool,
    pub is_readable: bool,
    pub is_writable_with_response: bool,
    pub is_writable_without_response: bool,
}

/// Criteria passed to the adapter when scanning. An empty list reports
/// every advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuids: Vec<String>,
}

/// One notification captured while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSample {
    pub characteristic_id: String,
    pub service_id: String,
    /// Encoded payload exactly as the adapter delivered it.
    pub raw_value: String,
    pub captured_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// How a notice is presented: a transient line or a blocking dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeStyle {
    Toast,
    Dialog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub body: String,
    pub severity: NoticeSeverity,
    pub style: NoticeStyle,
}

impl Notice {
    pub fn toast(severity: NoticeSeverity, title: &str, body: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            body: body.into(),
            severity,
            style: NoticeStyle::Toast,
        }
    }

    pub fn dialog(severity: NoticeSeverity, title: &str, body: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            body: body.into(),
            severity,
            style: NoticeStyle::Dialog,
        }
    }
}

/// Requests from the UI to the Bluetooth worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    StartStreaming,
    StopStreaming,
    Disconnect,
    Shutdown,
}

/// Updates from the Bluetooth worker to the UI.
#[derive(Debug, Clone)]
pub enum AppEvent {
    AdapterState(AdapterState),
    Scanning(bool),
    DevicesCleared,
    DeviceFound(DiscoveredDevice),
    Connecting(Option<DeviceId>),
    Connected(DiscoveredDevice),
    Disconnected,
    Streaming(bool),
    Sample(StreamSample),
    SamplesCleared,
    Notice(Notice),
}
