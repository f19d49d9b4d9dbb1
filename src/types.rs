use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_set, BTreeMap, BTreeSet},
    fmt,
    time::{Duration, SystemTime},
};

/// Lifecycle state of the link to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session is open
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Session is open
    Connected,
    /// Link was lost unexpectedly and a reconnect is scheduled
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// The single connection record kept for a configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnection {
    /// Device address
    pub address: String,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Last connection error, if any
    pub last_error: Option<String>,
}

impl DeviceConnection {
    /// Create a disconnected record for an address
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
            last_error: None,
        }
    }
}

/// Fitness machine kind, derived from the machine data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    /// Treadmill
    Treadmill,
    /// Cross trainer
    CrossTrainer,
    /// Step climber
    StepClimber,
    /// Stair climber
    StairClimber,
    /// Rower
    Rower,
    /// Indoor bike
    IndoorBike,
}

impl MachineType {
    /// Lowercase identifier, used by hosts as a translation key
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Treadmill => "treadmill",
            Self::CrossTrainer => "cross_trainer",
            Self::StepClimber => "step_climber",
            Self::StairClimber => "stair_climber",
            Self::Rower => "rower",
            Self::IndoorBike => "indoor_bike",
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Treadmill => write!(f, "Treadmill"),
            Self::CrossTrainer => write!(f, "Cross Trainer"),
            Self::StepClimber => write!(f, "Step Climber"),
            Self::StairClimber => write!(f, "Stair Climber"),
            Self::Rower => write!(f, "Rower"),
            Self::IndoorBike => write!(f, "Indoor Bike"),
        }
    }
}

/// Training status codes of the FTMS Training Status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Other
    Other = 0x00,
    /// Idle
    Idle = 0x01,
    /// Warming up
    WarmingUp = 0x02,
    /// Low intensity interval
    LowIntensityInterval = 0x03,
    /// High intensity interval
    HighIntensityInterval = 0x04,
    /// Recovery interval
    RecoveryInterval = 0x05,
    /// Isometric
    Isometric = 0x06,
    /// Heart rate control
    HeartRateControl = 0x07,
    /// Fitness test
    FitnessTest = 0x08,
    /// Speed below the control region
    SpeedOutsideControlRegionLow = 0x09,
    /// Speed above the control region
    SpeedOutsideControlRegionHigh = 0x0A,
    /// Cool down
    CoolDown = 0x0B,
    /// Watt control
    WattControl = 0x0C,
    /// Manual mode (quick start)
    ManualMode = 0x0D,
    /// Pre-workout
    PreWorkout = 0x0E,
    /// Post-workout
    PostWorkout = 0x0F,
}

impl From<u8> for TrainingStatus {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Idle,
            0x02 => Self::WarmingUp,
            0x03 => Self::LowIntensityInterval,
            0x04 => Self::HighIntensityInterval,
            0x05 => Self::RecoveryInterval,
            0x06 => Self::Isometric,
            0x07 => Self::HeartRateControl,
            0x08 => Self::FitnessTest,
            0x09 => Self::SpeedOutsideControlRegionLow,
            0x0A => Self::SpeedOutsideControlRegionHigh,
            0x0B => Self::CoolDown,
            0x0C => Self::WattControl,
            0x0D => Self::ManualMode,
            0x0E => Self::PreWorkout,
            0x0F => Self::PostWorkout,
            _ => Self::Other,
        }
    }
}

/// Belt or flywheel movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementDirection {
    /// Forward
    Forward,
    /// Backward
    Backward,
}

/// Enumerated attribute value reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnumValue {
    /// Training status
    TrainingStatus(TrainingStatus),
    /// Movement direction
    MovementDirection(MovementDirection),
}

impl EnumValue {
    /// Stable lowercase symbolic name
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::TrainingStatus(status) => match status {
                TrainingStatus::Other => "other",
                TrainingStatus::Idle => "idle",
                TrainingStatus::WarmingUp => "warming_up",
                TrainingStatus::LowIntensityInterval => "low_intensity_interval",
                TrainingStatus::HighIntensityInterval => "high_intensity_interval",
                TrainingStatus::RecoveryInterval => "recovery_interval",
                TrainingStatus::Isometric => "isometric",
                TrainingStatus::HeartRateControl => "heart_rate_control",
                TrainingStatus::FitnessTest => "fitness_test",
                TrainingStatus::SpeedOutsideControlRegionLow => "speed_outside_control_region_low",
                TrainingStatus::SpeedOutsideControlRegionHigh => {
                    "speed_outside_control_region_high"
                }
                TrainingStatus::CoolDown => "cool_down",
                TrainingStatus::WattControl => "watt_control",
                TrainingStatus::ManualMode => "manual_mode",
                TrainingStatus::PreWorkout => "pre_workout",
                TrainingStatus::PostWorkout => "post_workout",
            },
            Self::MovementDirection(direction) => match direction {
                MovementDirection::Forward => "forward",
                MovementDirection::Backward => "backward",
            },
        }
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Raw attribute value as reported by the telemetry client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Integer metric
    Integer(i64),
    /// Fractional metric
    Float(f64),
    /// Free-form text
    Text(String),
    /// Enumerated value
    Enum(EnumValue),
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<EnumValue> for AttributeValue {
    fn from(value: EnumValue) -> Self {
        Self::Enum(value)
    }
}

/// Immutable set of metric values captured at one point in time
///
/// A snapshot is never edited after construction. Newer data always arrives as
/// a whole new snapshot, so a reader holding one never sees values from two
/// different telemetry events mixed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    values: BTreeMap<String, AttributeValue>,
    timestamp: SystemTime,
}

impl TelemetrySnapshot {
    /// Capture a snapshot stamped with the current time
    #[must_use]
    pub fn new(values: BTreeMap<String, AttributeValue>) -> Self {
        Self {
            values,
            timestamp: SystemTime::now(),
        }
    }

    /// Look up a metric
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.values.get(key)
    }

    /// All metrics, ordered by key
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, AttributeValue> {
        &self.values
    }

    /// Capture time
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Number of metrics
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the snapshot carries no metrics
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for TelemetrySnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Metric keys a connected device actually reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    /// Create an empty capability set
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Check if a metric is supported
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    /// Add a metric key
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.0.insert(key.into())
    }

    /// Iterate supported keys in order
    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }

    /// Number of supported metrics
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if nothing is supported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "{{{}}}", keys.join(", "))
    }
}

/// Static identity fields from the Device Information Service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Manufacturer name
    pub manufacturer: Option<String>,
    /// Model number
    pub model: Option<String>,
    /// Serial number
    pub serial_number: Option<String>,
    /// Hardware revision
    pub hw_version: Option<String>,
    /// Firmware revision
    pub fw_version: Option<String>,
    /// Software revision
    pub sw_version: Option<String>,
}

impl DeviceInfo {
    /// Stable identifier: the serial number, or the address when the device
    /// reports none, reduced to lowercase alphanumerics
    #[must_use]
    pub fn unique_id(&self, address: &str) -> String {
        self.serial_number
            .as_deref()
            .unwrap_or(address)
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }
}

/// Connection timing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Delay before a scheduled reconnect in milliseconds
    pub reconnect_delay_ms: u64,
}

impl ConnectionParams {
    /// Connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reconnect debounce delay
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            poll_interval_ms: 30_000,
            reconnect_delay_ms: 5_000,
        }
    }
}
