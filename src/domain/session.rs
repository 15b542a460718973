use crate::domain::models::{AdapterState, DiscoveredDevice, StreamSample};
use std::collections::VecDeque;

pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Bounded history of stream samples, newest first. Pushing past capacity
/// drops the oldest sample.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<StreamSample>,
    capacity: usize,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: StreamSample) {
        self.samples.push_front(sample);
        self.samples.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &StreamSample> {
        self.samples.iter()
    }

    pub fn newest(&self) -> Option<&StreamSample> {
        self.samples.front()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}

/// Connection/streaming lifecycle of the single active device.
///
/// `S` is whatever keeps the notification subscriptions alive, so that
/// "streaming without a device" or "subscriptions while not streaming"
/// cannot be expressed.
pub enum SessionState<S> {
    Disconnected,
    Connected {
        device: DiscoveredDevice,
        samples: SampleBuffer,
    },
    Streaming {
        device: DiscoveredDevice,
        samples: SampleBuffer,
        subscriptions: S,
    },
}

impl<S> SessionState<S> {
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connected { device, .. } | SessionState::Streaming { device, .. } => {
                Some(device)
            }
        }
    }

    pub fn samples(&self) -> Option<&SampleBuffer> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connected { samples, .. } | SessionState::Streaming { samples, .. } => {
                Some(samples)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Streaming { .. })
    }
}

/// Which screen the shell shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Radio missing or access denied; nothing else is offered.
    Blocked,
    Discovery,
    Stream,
}

/// A live session keeps the stream view even if the radio becomes blocked,
/// so it can still be stopped and disconnected.
pub fn select_view(adapter_state: AdapterState, connected: bool) -> View {
    if connected {
        View::Stream
    } else if adapter_state.is_blocking() {
        View::Blocked
    } else {
        View::Discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample(n: usize) -> StreamSample {
        StreamSample {
            characteristic_id: "C1".to_string(),
            service_id: "S1".to_string(),
            raw_value: n.to_string(),
            captured_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_buffer_is_newest_first_and_bounded() {
        let mut buffer = SampleBuffer::new(100);
        for n in 0..150 {
            buffer.push(sample(n));
        }

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.newest().map(|s| s.raw_value.as_str()), Some("149"));
        assert_eq!(buffer.iter().last().map(|s| s.raw_value.as_str()), Some("50"));
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut buffer = SampleBuffer::new(0);
        buffer.push(sample(1));
        buffer.push(sample(2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.capacity(), 1);
    }

    #[test]
    fn test_session_accessors() {
        let state: SessionState<()> = SessionState::Disconnected;
        assert!(state.device().is_none());
        assert!(!state.is_streaming());

        let state: SessionState<()> = SessionState::Streaming {
            device: DiscoveredDevice::new("X"),
            samples: SampleBuffer::default(),
            subscriptions: (),
        };
        assert!(state.is_connected());
        assert!(state.is_streaming());
        assert_eq!(state.samples().map(SampleBuffer::len), Some(0));
    }

    #[test]
    fn test_view_selection() {
        assert_eq!(select_view(AdapterState::Unauthorized, false), View::Blocked);
        assert_eq!(select_view(AdapterState::Unsupported, true), View::Stream);
        assert_eq!(select_view(AdapterState::Unauthorized, true), View::Stream);
        assert_eq!(select_view(AdapterState::PoweredOff, false), View::Discovery);
        assert_eq!(select_view(AdapterState::PoweredOn, true), View::Stream);
    }
}
