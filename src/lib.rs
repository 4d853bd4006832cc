#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Reabilita
//!
//! Bluetooth Low Energy control core for the Reabilita rehabilitation device.
//!
//! The peripheral exposes one service with one characteristic. Commands are
//! written to it with response as short ASCII strings, and the same
//! characteristic reports status both by notification and on read.
//!
//! ## Architecture
//!
//! - [`transport`]: the platform stack behind a trait, with [`ble::BtleTransport`]
//!   as the btleplug implementation
//! - [`protocol`]: command encoding and status classification
//! - [`discovery`]: one bounded scan at a time, filtered by device name
//! - [`connection`]: the single active link and its disconnect cleanup
//! - [`reconciler`]: command writes plus the notification and polling channels,
//!   fused into one running flag
//! - [`state`]: shared connection and power state
//! - [`controller`]: the facade the presentation layer talks to
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library drives rehabilitation equipment attached to a
//! patient. The running flag is the app's belief, not a guarantee: it follows
//! accepted writes and the device's own stop reports. Keep a physical stop
//! within reach.
//!
//! ## Quick Start
//!
//! ```no_run
//! use reabilita::{DeviceController, SessionConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = DeviceController::with_bluetooth(SessionConfig::default()).await?;
//!
//!     controller.start_scan().await?;
//!     tokio::time::sleep(Duration::from_secs(6)).await;
//!
//!     let found = controller.discovery_results().await;
//!     let peripheral = found.first().ok_or("no Reabilita device nearby")?;
//!     controller.connect_to(peripheral).await?;
//!
//!     controller.set_speed(3).await;
//!     controller.set_intensity(2).await;
//!     controller.set_repetitions(10).await;
//!
//!     // Sends LIGAR,3,2,10
//!     controller.toggle().await?;
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Connection lifecycle
pub mod connection;
/// Facade for the presentation layer
pub mod controller;
/// Scan lifecycle
pub mod discovery;
/// Error types and handling
pub mod error;
/// In-memory transport for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;
/// Command and status wire format
pub mod protocol;
/// Running-state reconciliation
pub mod reconciler;
/// Shared connection state and notice bus
pub mod state;
/// Transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use controller::DeviceController;
pub use error::{ReabilitaError, Result};
pub use protocol::{Command, StatusSignal};
pub use reconciler::RunEvent;
pub use transport::Transport;
pub use types::{
    AdapterPowerState, Connection, ControlParameters, Notice, Parameter, PeripheralHandle,
    SessionConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Advertised name of the peripheral; scans surface only exact matches
pub const PERIPHERAL_NAME: &str = "Reabilita";

/// Service exposed by the peripheral firmware
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_1234_1234_1234_5678_9abc);

/// Characteristic that receives commands (write with response)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0xabcd_1234_5678_90ab_cdef_1234_5678_90ab);

/// Characteristic that reports status (read and notify)
///
/// The firmware uses the command characteristic for this too.
pub const STATUS_CHAR_UUID: Uuid = COMMAND_CHAR_UUID;
