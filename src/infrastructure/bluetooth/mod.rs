//! Bluetooth Module
//!
//! Scanning, connecting and notification streaming over a pluggable adapter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                     │
//! │   (commands in, AppEvents out, one select loop)         │
//! └─────────────┬─────────────────────────────┬─────────────┘
//!               │                             │
//!               ▼                             ▼
//!     ┌──────────────────┐          ┌────────────────────┐
//!     │ DiscoveryControl │          │ StreamingControl   │
//!     │ - scan window    │          │ - subscriptions    │
//!     │ - device list    │          │ - sample buffer    │
//!     │ - connect        │          │ - link loss        │
//!     └────────┬─────────┘          └─────────┬──────────┘
//!              └──────────────┬───────────────┘
//!                             ▼
//!                  ┌─────────────────────┐
//!                  │  dyn BleAdapter     │
//!                  │  winrt │ mock │ n/a │
//!                  └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - The adapter facade every backend implements
//! - [`discovery`] - Scan window, deduplication and connection attempts
//! - [`streaming`] - Notification subscriptions and the sample history
//! - [`service`] - Main service coordinator
//! - [`mock`] - In-memory backend for tests and the simulated mode

pub mod adapter;
pub mod discovery;
pub mod error;
pub mod ids;
pub mod mock;
pub mod service;
pub mod streaming;
#[cfg(not(windows))]
pub mod unsupported;
#[cfg(windows)]
pub mod winrt;

pub use adapter::BleAdapter;
pub use service::BluetoothService;
