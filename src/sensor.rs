//! Sensor catalog and value resolution.
//!
//! Every metric an FTMS device can report has a static [`SensorDescriptor`].
//! The configured sensor keys are intersected with the catalog and with the
//! device's [`CapabilitySet`]; the resulting selection drives a
//! [`SensorValueResolver`] that turns raw attributes into typed readings.

use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    client::AttributeSource,
    types::{AttributeValue, CapabilitySet, TelemetrySnapshot},
};

/// Display unit of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// km/h
    KilometersPerHour,
    /// m
    Meters,
    /// rpm
    RevolutionsPerMinute,
    /// kWh
    KilowattHours,
    /// W
    Watts,
    /// s
    Seconds,
    /// bpm
    BeatsPerMinute,
    /// %
    Percent,
}

impl Unit {
    /// Unit symbol
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::KilometersPerHour => "km/h",
            Self::Meters => "m",
            Self::RevolutionsPerMinute => "rpm",
            Self::KilowattHours => "kWh",
            Self::Watts => "W",
            Self::Seconds => "s",
            Self::BeatsPerMinute => "bpm",
            Self::Percent => "%",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Physical quantity a sensor measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Speed
    Speed,
    /// Distance
    Distance,
    /// Energy
    Energy,
    /// Power
    Power,
    /// Duration
    Duration,
    /// Heart rate
    HeartRate,
}

/// How consecutive values of a sensor relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateClass {
    /// Instantaneous value
    Measurement,
    /// Running total that only grows within a workout
    TotalIncreasing,
}

/// Static description of one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorDescriptor {
    /// Metric key, identical to the attribute key
    pub key: &'static str,
    /// Display unit
    pub unit: Option<Unit>,
    /// Measured quantity
    pub device_class: Option<DeviceClass>,
    /// Aggregation class
    pub state_class: Option<StateClass>,
}

impl SensorDescriptor {
    const fn new(
        key: &'static str,
        unit: Option<Unit>,
        device_class: Option<DeviceClass>,
        state_class: Option<StateClass>,
    ) -> Self {
        Self {
            key,
            unit,
            device_class,
            state_class,
        }
    }
}

/// Every sensor an FTMS device may report
pub static SENSOR_DESCRIPTIONS: [SensorDescriptor; 17] = [
    // Speed
    SensorDescriptor::new(
        "speed_instant",
        Some(Unit::KilometersPerHour),
        Some(DeviceClass::Speed),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "speed_average",
        Some(Unit::KilometersPerHour),
        Some(DeviceClass::Speed),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "speed_maximum",
        Some(Unit::KilometersPerHour),
        Some(DeviceClass::Speed),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "distance_total",
        Some(Unit::Meters),
        Some(DeviceClass::Distance),
        Some(StateClass::TotalIncreasing),
    ),
    // Cadence
    SensorDescriptor::new(
        "cadence",
        Some(Unit::RevolutionsPerMinute),
        None,
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "cadence_average",
        Some(Unit::RevolutionsPerMinute),
        None,
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "cadence_maximum",
        Some(Unit::RevolutionsPerMinute),
        None,
        Some(StateClass::Measurement),
    ),
    // Energy and power
    SensorDescriptor::new(
        "energy_total",
        Some(Unit::KilowattHours),
        Some(DeviceClass::Energy),
        Some(StateClass::TotalIncreasing),
    ),
    SensorDescriptor::new(
        "energy_per_hour",
        Some(Unit::KilowattHours),
        Some(DeviceClass::Energy),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "power_output",
        Some(Unit::Watts),
        Some(DeviceClass::Power),
        Some(StateClass::Measurement),
    ),
    // Time
    SensorDescriptor::new(
        "time_elapsed",
        Some(Unit::Seconds),
        Some(DeviceClass::Duration),
        Some(StateClass::TotalIncreasing),
    ),
    SensorDescriptor::new(
        "time_remaining",
        Some(Unit::Seconds),
        Some(DeviceClass::Duration),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "heart_rate",
        Some(Unit::BeatsPerMinute),
        Some(DeviceClass::HeartRate),
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new("step_count", None, None, Some(StateClass::TotalIncreasing)),
    SensorDescriptor::new(
        "inclination",
        Some(Unit::Percent),
        None,
        Some(StateClass::Measurement),
    ),
    SensorDescriptor::new(
        "elevation_gain",
        Some(Unit::Meters),
        Some(DeviceClass::Distance),
        Some(StateClass::TotalIncreasing),
    ),
    SensorDescriptor::new("training_status", None, None, None),
];

/// Look up a sensor by key
#[must_use]
pub fn descriptor(key: &str) -> Option<&'static SensorDescriptor> {
    SENSOR_DESCRIPTIONS.iter().find(|d| d.key == key)
}

/// Intersect the configured keys with the catalog and the device capabilities
///
/// Keeps the configured order and drops duplicates. Unknown or unsupported
/// keys are skipped with a warning.
pub fn select_sensors<S: AsRef<str>>(
    selected: &[S],
    capabilities: &CapabilitySet,
) -> Vec<&'static SensorDescriptor> {
    let mut sensors: Vec<&'static SensorDescriptor> = Vec::with_capacity(selected.len());

    for key in selected {
        let key = key.as_ref();
        let Some(sensor) = descriptor(key) else {
            warn!("Unknown sensor type: {}", key);
            continue;
        };
        if !capabilities.contains(key) {
            warn!("Sensor {} is not supported by the device, skipping", key);
            continue;
        }
        if sensors.iter().any(|s| s.key == key) {
            continue;
        }
        sensors.push(sensor);
    }

    sensors
}

/// Typed value of a sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorValue {
    /// Integer value
    Integer(i64),
    /// Fractional value
    Float(f64),
    /// Text, including enumerated values as their lowercase symbol
    Text(String),
}

impl From<AttributeValue> for SensorValue {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Integer(v) => Self::Integer(v),
            AttributeValue::Float(v) => Self::Float(v),
            AttributeValue::Text(v) => Self::Text(v),
            AttributeValue::Enum(v) => Self::Text(v.symbol().to_string()),
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Current value of one selected sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Sensor description
    pub descriptor: &'static SensorDescriptor,
    /// Current value; `None` when the device has not reported it
    pub value: Option<SensorValue>,
}

impl SensorReading {
    /// Metric key
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.descriptor.key
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.value, self.descriptor.unit) {
            (Some(value), Some(unit)) => write!(f, "{}: {} {}", self.key(), value, unit),
            (Some(value), None) => write!(f, "{}: {}", self.key(), value),
            (None, _) => write!(f, "{}: unknown", self.key()),
        }
    }
}

/// Produces typed readings for a fixed sensor selection
#[derive(Debug, Clone)]
pub struct SensorValueResolver {
    sensors: Vec<&'static SensorDescriptor>,
}

impl SensorValueResolver {
    /// Resolve the given sensors
    #[must_use]
    pub const fn new(sensors: Vec<&'static SensorDescriptor>) -> Self {
        Self { sensors }
    }

    /// Selected sensors in configured order
    #[must_use]
    pub fn sensors(&self) -> &[&'static SensorDescriptor] {
        &self.sensors
    }

    /// Read one attribute and normalize it
    ///
    /// Missing or unreadable attributes resolve to `None`; enumerated values
    /// become their lowercase symbol.
    pub async fn resolve_value<S>(source: &S, key: &str) -> Option<SensorValue>
    where
        S: AttributeSource + ?Sized,
    {
        match source.attribute(key).await {
            Ok(value) => value.map(SensorValue::from),
            Err(e) => {
                debug!("Error updating sensor {}: {}", key, e);
                None
            }
        }
    }

    /// Readings for every selected sensor
    pub async fn resolve<S>(&self, source: &S) -> Vec<SensorReading>
    where
        S: AttributeSource + ?Sized,
    {
        let mut readings = Vec::with_capacity(self.sensors.len());
        for &descriptor in &self.sensors {
            readings.push(SensorReading {
                descriptor,
                value: Self::resolve_value(source, descriptor.key).await,
            });
        }
        readings
    }

    fn unknown_readings(&self) -> Arc<[SensorReading]> {
        self.sensors
            .iter()
            .map(|&descriptor| SensorReading {
                descriptor,
                value: None,
            })
            .collect()
    }

    /// Keep readings in sync with a snapshot stream
    ///
    /// Readers are only notified when the readings actually change. The task
    /// stops when the snapshot sender or every readings receiver is gone.
    pub fn spawn(
        self,
        mut snapshots: watch::Receiver<Arc<TelemetrySnapshot>>,
    ) -> (watch::Receiver<Arc<[SensorReading]>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(self.unknown_readings());

        let handle = tokio::spawn(async move {
            loop {
                let snapshot = Arc::clone(&snapshots.borrow_and_update());
                let readings = self.resolve(snapshot.as_ref()).await;
                tx.send_if_modified(|current| {
                    if current.as_ref() == readings.as_slice() {
                        false
                    } else {
                        *current = readings.into();
                        true
                    }
                });

                tokio::select! {
                    () = tx.closed() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Sensor resolver stopped");
        });

        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{FtmsError, Result},
        types::{EnumValue, TrainingStatus},
    };
    use async_trait::async_trait;
    use std::{collections::HashSet, time::Duration};

    struct Unreadable;

    #[async_trait]
    impl AttributeSource for Unreadable {
        async fn attribute(&self, key: &str) -> Result<Option<AttributeValue>> {
            Err(FtmsError::AttributeUnavailable {
                key: key.to_string(),
                reason: "not readable".to_string(),
            })
        }
    }

    #[test]
    fn test_catalog_keys_are_unique() {
        let keys: HashSet<_> = SENSOR_DESCRIPTIONS.iter().map(|d| d.key).collect();
        assert_eq!(keys.len(), SENSOR_DESCRIPTIONS.len());

        let power = descriptor("power_output").unwrap();
        assert_eq!(power.unit, Some(Unit::Watts));
        assert_eq!(power.state_class, Some(StateClass::Measurement));

        let distance = descriptor("distance_total").unwrap();
        assert_eq!(distance.state_class, Some(StateClass::TotalIncreasing));

        assert!(descriptor("altitude").is_none());
    }

    #[test]
    fn test_selection_filters_by_capability() {
        let capabilities: CapabilitySet = ["power_output", "cadence"].into_iter().collect();
        let sensors = select_sensors(&["power_output", "heart_rate"], &capabilities);

        let keys: Vec<_> = sensors.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["power_output"]);
    }

    #[test]
    fn test_selection_keeps_order_and_drops_unknown() {
        let capabilities: CapabilitySet = ["power_output", "cadence", "heart_rate"]
            .into_iter()
            .collect();
        let sensors = select_sensors(
            &["heart_rate", "warp_factor", "cadence", "heart_rate"],
            &capabilities,
        );

        let keys: Vec<_> = sensors.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["heart_rate", "cadence"]);
        assert!(sensors.iter().all(|s| capabilities.contains(s.key)));
    }

    #[tokio::test]
    async fn test_enum_values_become_symbols() {
        let snapshot: TelemetrySnapshot = [(
            "training_status",
            EnumValue::TrainingStatus(TrainingStatus::WarmingUp),
        )]
        .into_iter()
        .collect();

        let value = SensorValueResolver::resolve_value(&snapshot, "training_status").await;
        assert_eq!(value, Some(SensorValue::Text("warming_up".to_string())));
    }

    #[tokio::test]
    async fn test_missing_and_unreadable_values_are_absent() {
        let snapshot = TelemetrySnapshot::default();
        assert!(SensorValueResolver::resolve_value(&snapshot, "cadence")
            .await
            .is_none());
        assert!(SensorValueResolver::resolve_value(&Unreadable, "cadence")
            .await
            .is_none());

        let resolver = SensorValueResolver::new(vec![descriptor("cadence").unwrap()]);
        let readings = resolver.resolve(&Unreadable).await;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].key(), "cadence");
        assert!(readings[0].value.is_none());
    }

    #[test]
    fn test_reading_display() {
        let reading = SensorReading {
            descriptor: descriptor("power_output").unwrap(),
            value: Some(SensorValue::Integer(120)),
        };
        assert_eq!(reading.to_string(), "power_output: 120 W");

        let unknown = SensorReading {
            descriptor: descriptor("training_status").unwrap(),
            value: None,
        };
        assert_eq!(unknown.to_string(), "training_status: unknown");
    }

    #[tokio::test]
    async fn test_spawned_resolver_follows_snapshots() {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(TelemetrySnapshot::default()));
        let resolver = SensorValueResolver::new(vec![
            descriptor("power_output").unwrap(),
            descriptor("cadence").unwrap(),
        ]);
        let (mut readings, handle) = resolver.spawn(snapshot_rx);
        assert!(readings.borrow().iter().all(|r| r.value.is_none()));

        snapshot_tx.send_replace(Arc::new(
            [("power_output", 120_i64), ("cadence", 85)].into_iter().collect(),
        ));
        tokio::time::timeout(Duration::from_secs(1), readings.changed())
            .await
            .unwrap()
            .unwrap();
        let current = readings.borrow_and_update().clone();
        assert_eq!(current[0].value, Some(SensorValue::Integer(120)));
        assert_eq!(current[1].value, Some(SensorValue::Integer(85)));

        // A snapshot with identical sensor values does not notify readers
        snapshot_tx.send_replace(Arc::new(
            [("power_output", 120_i64), ("cadence", 85), ("heart_rate", 140)]
                .into_iter()
                .collect(),
        ));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!readings.has_changed().unwrap());

        drop(snapshot_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
