#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ftms-link
//!
//! A resilient Bluetooth Low Energy telemetry link for FTMS fitness machines
//! (treadmills, indoor bikes, rowers, cross trainers, step and stair climbers).
//!
//! The crate keeps one long-lived connection to a device that implements the
//! Bluetooth Fitness Machine Service and turns whatever it reports into typed,
//! unit-tagged sensor readings:
//!
//! - **Connection lifecycle**: connect with a time budget, tell a missing
//!   optional characteristic apart from a real failure, and detect link loss
//! - **Debounced reconnect**: a burst of disconnect notifications results in a
//!   single delayed reconnect attempt
//! - **Snapshot cache**: pushed telemetry replaces the cached snapshot, a slow
//!   poll restores a lost link, and the last snapshot stays available while
//!   the device is away
//! - **Sensor readings**: configured sensors are filtered against what the
//!   device supports and resolved into typed values
//!
//! Scanning for devices and decoding FTMS frames are left to the host: plug
//! them in through [`Discovery`] and [`ble::FrameDecoder`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use ftms_link::{
//!     mock::{MockDiscovery, MockTelemetryClient},
//!     FtmsConfig, FtmsSession,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = MockDiscovery::new();
//!     discovery
//!         .insert(MockDiscovery::fitness_machine("AA:BB:CC:DD:EE:FF"))
//!         .await;
//!
//!     let config = FtmsConfig::new("AA:BB:CC:DD:EE:FF", ["power_output", "cadence"]);
//!     let session = FtmsSession::setup(config, &discovery, |info| {
//!         Ok(MockTelemetryClient::from_service_info(&info)?
//!             .with_capabilities(["power_output", "cadence"]))
//!     })
//!     .await?;
//!
//!     for reading in session.readings().iter() {
//!         println!("{reading}");
//!     }
//!
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy client built on btleplug
pub mod ble;
/// Telemetry client abstraction and event channel
pub mod client;
/// Device link configuration
pub mod config;
/// Connection lifecycle management
pub mod connection;
/// Snapshot cache and refresh loop
pub mod coordinator;
/// Device lookup and advertisement updates
pub mod discovery;
/// Error types and handling
pub mod error;
/// In-memory client and discovery for tests and demos
pub mod mock;
/// Debounced reconnection
pub mod reconnect;
/// Sensor catalog and value resolution
pub mod sensor;
/// Device session orchestration
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use client::{AttributeSource, ClientEvent, TelemetryClient};
pub use config::FtmsConfig;
pub use connection::{ConnectOutcome, ConnectionManager, LinkLoss};
pub use coordinator::{DataCoordinator, LinkObserver};
pub use discovery::{Advertisement, BleDiscovery, Discovery, ServiceInfo};
pub use error::{FtmsError, NotReady, NotReadyReason, Result};
pub use reconnect::ReconnectScheduler;
pub use sensor::{SensorDescriptor, SensorReading, SensorValue, SensorValueResolver};
pub use session::FtmsSession;
pub use types::{
    AttributeValue, CapabilitySet, ConnectionParams, ConnectionState, DeviceConnection, DeviceInfo,
    EnumValue, MachineType, MovementDirection, TelemetrySnapshot, TrainingStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a 16-bit Bluetooth SIG identifier into a full UUID
#[must_use]
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

/// Fitness Machine Service UUID
///
/// Devices advertising this service are treated as fitness machines; any
/// other peer is rejected during setup.
pub const FTMS_SERVICE_UUID: Uuid = bluetooth_uuid(0x1826);
