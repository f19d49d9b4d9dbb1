use std::fmt;

use thiserror::Error;

/// Errors that can occur while maintaining a link to an FTMS fitness machine
#[derive(Error, Debug)]
pub enum FtmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Discovery has no current record for the address
    #[error("No advertisement known for device {address}")]
    DeviceNotFound {
        /// Configured device address
        address: String,
    },

    /// The peer does not implement the Fitness Machine Service
    #[error("Device {address} is not a fitness machine")]
    ProtocolMismatch {
        /// Device address
        address: String,
    },

    /// Connect attempt exceeded its time budget
    #[error("Connection to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Device address
        address: String,
        /// Timeout budget in milliseconds
        timeout_ms: u64,
    },

    /// Transport-level connection failure
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// Device address
        address: String,
        /// Transport failure description
        reason: String,
    },

    /// An optional characteristic is absent; the device stays usable
    #[error("Device does not support characteristic: {0}")]
    CharacteristicMissing(String),

    /// Link lost after a successful setup
    #[error("Device {address} disconnected unexpectedly")]
    TransientDisconnect {
        /// Device address
        address: String,
    },

    /// An attribute could not be read
    #[error("Attribute {key} unavailable: {reason}")]
    AttributeUnavailable {
        /// Metric key
        key: String,
        /// Why the attribute could not be read
        reason: String,
    },

    /// Configuration values are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Operation requires an active session
    #[error("Device not connected")]
    NotConnected,
}

/// Result type for FTMS link operations
pub type Result<T> = std::result::Result<T, FtmsError>;

impl FtmsError {
    /// Check if the device remains usable despite this error
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::CharacteristicMissing(_))
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::NoAdapter
                | Self::ConnectFailed { .. }
                | Self::ConnectTimeout { .. }
                | Self::TransientDisconnect { .. }
                | Self::DeviceNotFound { .. }
                | Self::NotConnected
        )
    }

    /// Check if the caller may retry the failed operation later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectFailed { .. }
                | Self::TransientDisconnect { .. }
                | Self::Ble(_)
        )
    }

    /// Reason code reported when this error aborts setup
    #[must_use]
    pub const fn not_ready_reason(&self) -> Option<NotReadyReason> {
        match self {
            Self::DeviceNotFound { .. } => Some(NotReadyReason::DeviceNotFound),
            Self::ProtocolMismatch { .. } => Some(NotReadyReason::ProtocolMismatch),
            Self::ConnectTimeout { .. } => Some(NotReadyReason::ConnectionTimeout),
            Self::ConnectFailed { .. } | Self::Ble(_) | Self::NoAdapter | Self::NotConnected => {
                Some(NotReadyReason::ConnectionFailed)
            }
            Self::InvalidConfig(_) | Self::ConfigParse(_) => {
                Some(NotReadyReason::InvalidConfiguration)
            }
            Self::CharacteristicMissing(_)
            | Self::TransientDisconnect { .. }
            | Self::AttributeUnavailable { .. } => None,
        }
    }
}

/// Stable reason codes for a failed setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotReadyReason {
    /// No advertisement for the configured address
    DeviceNotFound,
    /// The peer is not a fitness machine
    ProtocolMismatch,
    /// The connect attempt timed out
    ConnectionTimeout,
    /// The connect attempt failed
    ConnectionFailed,
    /// The configuration was rejected
    InvalidConfiguration,
}

impl NotReadyReason {
    /// Locale-independent code for host translation tables
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::DeviceNotFound => "device_not_found",
            Self::ProtocolMismatch => "ftms_error",
            Self::ConnectionTimeout => "connection_timeout",
            Self::ConnectionFailed => "connection_failed",
            Self::InvalidConfiguration => "invalid_configuration",
        }
    }
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Setup failed; the caller decides whether and when to retry
#[derive(Error, Debug)]
#[error("Device {address} not ready ({reason}): {source}")]
pub struct NotReady {
    /// Configured device address
    pub address: String,
    /// Reason code
    pub reason: NotReadyReason,
    /// Underlying error
    #[source]
    pub source: FtmsError,
}

impl NotReady {
    /// Wrap a setup error, deriving the reason code from its kind
    #[must_use]
    pub fn new(address: impl Into<String>, source: FtmsError) -> Self {
        let reason = source
            .not_ready_reason()
            .unwrap_or(NotReadyReason::ConnectionFailed);
        Self {
            address: address.into(),
            reason,
            source,
        }
    }

    /// Check if a later retry may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}
