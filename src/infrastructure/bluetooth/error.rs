//! Error types for the Bluetooth layer

use crate::domain::models::{AdapterState, DeviceId, Notice, NoticeSeverity};
use thiserror::Error;

/// Failures reported by an adapter backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth adapter not available ({0})")]
    AdapterUnavailable(AdapterState),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Invalid device identifier")]
    InvalidDeviceId,

    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    #[error("Device not connected: {0}")]
    NotConnected(DeviceId),

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Platform error: {0}")]
    Platform(String),
}

#[cfg(windows)]
impl From<windows::core::Error> for BleError {
    fn from(err: windows::core::Error) -> Self {
        BleError::Platform(err.message().to_string())
    }
}

/// Failures of the discovery/streaming operations, as shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth is not enabled (adapter state: {0})")]
    AdapterUnavailable(AdapterState),

    #[error("A scan is already running")]
    ScanInProgress,

    #[error("Scan error: {0}")]
    Scan(#[source] BleError),

    #[error("Already connecting to {0}")]
    ConnectionInProgress(DeviceId),

    #[error("Already connected to {0}")]
    AlreadyConnected(DeviceId),

    #[error("Could not connect to {device}: {source}")]
    Connection {
        device: DeviceId,
        #[source]
        source: BleError,
    },

    #[error("No device connected")]
    NotConnected,

    #[error("Streaming is already active")]
    AlreadyStreaming,

    #[error("Failed to stream data: {0}")]
    StreamingSetup(#[source] BleError),

    #[error("Failed to disconnect device: {0}")]
    Disconnect(#[source] BleError),
}

impl SessionError {
    /// User-facing notice for this failure.
    pub fn notice(&self) -> Notice {
        match self {
            SessionError::AdapterUnavailable(_) => Notice::dialog(
                NoticeSeverity::Error,
                "Bluetooth Error",
                "Bluetooth is not enabled",
            ),
            SessionError::ScanInProgress | SessionError::ConnectionInProgress(_) => {
                Notice::toast(NoticeSeverity::Warning, "Busy", self.to_string())
            }
            SessionError::Scan(_) => {
                Notice::toast(NoticeSeverity::Warning, "Scan Stopped", self.to_string())
            }
            SessionError::AlreadyConnected(_) | SessionError::NotConnected => {
                Notice::toast(NoticeSeverity::Warning, "Connection", self.to_string())
            }
            SessionError::Connection { .. } => Notice::dialog(
                NoticeSeverity::Error,
                "Connection Failed",
                "Could not connect",
            ),
            SessionError::AlreadyStreaming => {
                Notice::toast(NoticeSeverity::Info, "Streaming", self.to_string())
            }
            SessionError::StreamingSetup(_) => Notice::toast(
                NoticeSeverity::Error,
                "Streaming Error",
                "Failed to stream data",
            ),
            SessionError::Disconnect(_) => Notice::toast(
                NoticeSeverity::Error,
                "Disconnect Error",
                "Failed to disconnect device",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NoticeStyle;

    #[test]
    fn test_connection_failure_is_a_dialog() {
        let err = SessionError::Connection {
            device: DeviceId::new("X"),
            source: BleError::ConnectionFailed("unreachable".to_string()),
        };
        let notice = err.notice();
        assert_eq!(notice.style, NoticeStyle::Dialog);
        assert_eq!(notice.severity, NoticeSeverity::Error);
        assert_eq!(notice.title, "Connection Failed");
    }

    #[test]
    fn test_streaming_failure_is_a_toast() {
        let notice = SessionError::StreamingSetup(BleError::Cancelled).notice();
        assert_eq!(notice.style, NoticeStyle::Toast);
        assert_eq!(notice.body, "Failed to stream data");
    }
}
