//! Telemetry client abstraction.
//!
//! The [`TelemetryClient`] trait is the boundary to the protocol side of the
//! link: it opens and closes the Bluetooth session and reports what the device
//! supports. Telemetry and link-loss notifications travel over a
//! [`ClientEvent`] channel drained by a single coordinator task instead of
//! being delivered through callbacks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    discovery::ServiceInfo,
    error::Result,
    types::{AttributeValue, CapabilitySet, DeviceInfo, MachineType, TelemetrySnapshot},
};

/// Notification pushed by a telemetry client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Fresh values for every attribute the client currently knows
    Telemetry(TelemetrySnapshot),
    /// The link dropped
    Disconnected {
        /// Whether the client still wanted to be connected when the link
        /// dropped; `false` means the drop followed an explicit disconnect
        need_connect: bool,
    },
}

/// Sender half of a client event channel
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Receiver half of a client event channel
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Create a client event channel
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Anything that can answer "what is the current value of this metric"
#[async_trait]
pub trait AttributeSource: Send + Sync {
    /// Read one attribute
    ///
    /// `Ok(None)` means the attribute has no value yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the attribute is not accessible.
    async fn attribute(&self, key: &str) -> Result<Option<AttributeValue>>;
}

#[async_trait]
impl AttributeSource for TelemetrySnapshot {
    async fn attribute(&self, key: &str) -> Result<Option<AttributeValue>> {
        Ok(self.get(key).cloned())
    }
}

/// Protocol client for one fitness machine
///
/// Implementations keep a need-connect flag: it is raised by [`connect`] and
/// cleared by [`disconnect`], and is copied into every
/// [`ClientEvent::Disconnected`] so the receiver can tell an explicit
/// disconnect from an unexpected link loss.
///
/// [`connect`]: TelemetryClient::connect
/// [`disconnect`]: TelemetryClient::disconnect
#[async_trait]
pub trait TelemetryClient: AttributeSource {
    /// Device handle type supplied by discovery
    type Device: Clone + Send + Sync + 'static;

    /// Device address
    fn address(&self) -> &str;

    /// Open the session
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::CharacteristicMissing`] when the session opened but
    /// an optional characteristic is absent. Any other error means the session
    /// is not usable.
    ///
    /// [`FtmsError::CharacteristicMissing`]: crate::FtmsError::CharacteristicMissing
    async fn connect(&self) -> Result<()>;

    /// Close the session; must be safe to call repeatedly
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses to disconnect.
    async fn disconnect(&self) -> Result<()>;

    /// Route telemetry and link notifications to `sender`
    async fn set_event_sender(&self, sender: EventSender);

    /// Metrics the connected device reports
    async fn available_properties(&self) -> CapabilitySet;

    /// Static identity fields
    async fn device_info(&self) -> DeviceInfo;

    /// Machine kind, once known
    async fn machine_type(&self) -> Option<MachineType>;

    /// Whether the client currently wants to be connected
    fn need_connect(&self) -> bool;

    /// Refresh addressing data from a new advertisement without reconnecting
    async fn update_service_info(&self, info: ServiceInfo<Self::Device>);
}
