//! BLE Stream Monitor
//!
//! Scan for Bluetooth LE peripherals, connect to one, and watch the values
//! of all its notifiable characteristics as they arrive.
//!
//! - [`domain`] - Plain data: devices, samples, session state, settings
//! - [`infrastructure`] - Adapter backends, controllers and the service loop

pub mod domain;
pub mod infrastructure;
