use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Peripheral as _, ValueNotification},
    platform::{Adapter, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    bluetooth_uuid,
    client::{AttributeSource, ClientEvent, EventSender, TelemetryClient},
    discovery::{Advertisement, ServiceInfo},
    error::{FtmsError, Result},
    types::{AttributeValue, CapabilitySet, DeviceInfo, MachineType, TelemetrySnapshot},
};

/// Fitness Machine Feature characteristic
pub const FITNESS_MACHINE_FEATURE_UUID: Uuid = bluetooth_uuid(0x2ACC);
/// Training Status characteristic
pub const TRAINING_STATUS_UUID: Uuid = bluetooth_uuid(0x2AD3);

/// Machine data characteristics and the machine kind each one identifies
pub const MACHINE_DATA_CHARACTERISTICS: [(Uuid, MachineType); 6] = [
    (bluetooth_uuid(0x2ACD), MachineType::Treadmill),
    (bluetooth_uuid(0x2ACE), MachineType::CrossTrainer),
    (bluetooth_uuid(0x2ACF), MachineType::StepClimber),
    (bluetooth_uuid(0x2AD0), MachineType::StairClimber),
    (bluetooth_uuid(0x2AD1), MachineType::Rower),
    (bluetooth_uuid(0x2AD2), MachineType::IndoorBike),
];

const MANUFACTURER_NAME_UUID: Uuid = bluetooth_uuid(0x2A29);
const MODEL_NUMBER_UUID: Uuid = bluetooth_uuid(0x2A24);
const SERIAL_NUMBER_UUID: Uuid = bluetooth_uuid(0x2A25);
const FIRMWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2A26);
const HARDWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2A27);
const SOFTWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2A28);

/// Turns raw FTMS frames into named attribute values
///
/// The frame layout lives outside this crate; the client only routes frames
/// and merges what the decoder returns.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Metrics a machine reports, given its kind and the raw Fitness Machine
    /// Feature value (absent when the characteristic is missing)
    fn capabilities(&self, machine_type: MachineType, features: Option<&[u8]>) -> CapabilitySet;

    /// Decode one notification
    ///
    /// # Errors
    ///
    /// Returns an error for frames that cannot be parsed; the frame is dropped.
    fn decode(&self, characteristic: Uuid, frame: Bytes) -> Result<Vec<(String, AttributeValue)>>;
}

/// FTMS telemetry client over btleplug
pub struct BleTelemetryClient<D> {
    address: String,
    adapter: Adapter,
    peripheral: RwLock<Peripheral>,
    advertisement: RwLock<Advertisement>,
    decoder: Arc<D>,
    values: Arc<RwLock<BTreeMap<String, AttributeValue>>>,
    capabilities: RwLock<CapabilitySet>,
    device_info: RwLock<DeviceInfo>,
    machine_type: RwLock<Option<MachineType>>,
    need_connect: Arc<AtomicBool>,
    sender: Arc<RwLock<Option<EventSender>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: FrameDecoder> BleTelemetryClient<D> {
    /// Create a client for an advertised fitness machine
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ProtocolMismatch`] if the advertisement does not
    /// announce the Fitness Machine Service.
    pub fn new(info: ServiceInfo<Peripheral>, adapter: Adapter, decoder: D) -> Result<Self> {
        if !info.advertisement.is_fitness_machine() {
            return Err(FtmsError::ProtocolMismatch {
                address: info.address,
            });
        }

        Ok(Self {
            address: info.address,
            adapter,
            peripheral: RwLock::new(info.device),
            advertisement: RwLock::new(info.advertisement),
            decoder: Arc::new(decoder),
            values: Arc::new(RwLock::new(BTreeMap::new())),
            capabilities: RwLock::new(CapabilitySet::new()),
            device_info: RwLock::new(DeviceInfo::default()),
            machine_type: RwLock::new(None),
            need_connect: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(RwLock::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Latest advertisement data
    pub async fn advertisement(&self) -> Advertisement {
        self.advertisement.read().await.clone()
    }

    async fn stop_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

fn find_characteristic(characteristics: &BTreeSet<Characteristic>, uuid: Uuid) -> Option<Characteristic> {
    characteristics.iter().find(|c| c.uuid == uuid).cloned()
}

async fn read_string(
    peripheral: &Peripheral,
    characteristics: &BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Option<String> {
    let characteristic = find_characteristic(characteristics, uuid)?;
    match peripheral.read(&characteristic).await {
        Ok(raw) => {
            let text = String::from_utf8_lossy(&raw)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            debug!("Failed to read {}: {}", uuid, e);
            None
        }
    }
}

async fn read_device_info(
    peripheral: &Peripheral,
    characteristics: &BTreeSet<Characteristic>,
) -> DeviceInfo {
    DeviceInfo {
        manufacturer: read_string(peripheral, characteristics, MANUFACTURER_NAME_UUID).await,
        model: read_string(peripheral, characteristics, MODEL_NUMBER_UUID).await,
        serial_number: read_string(peripheral, characteristics, SERIAL_NUMBER_UUID).await,
        hw_version: read_string(peripheral, characteristics, HARDWARE_REVISION_UUID).await,
        fw_version: read_string(peripheral, characteristics, FIRMWARE_REVISION_UUID).await,
        sw_version: read_string(peripheral, characteristics, SOFTWARE_REVISION_UUID).await,
    }
}

/// Decode notifications and publish the merged attribute map as a snapshot
async fn pump_notifications<S, D>(
    mut notifications: S,
    decoder: Arc<D>,
    values: Arc<RwLock<BTreeMap<String, AttributeValue>>>,
    sender: Arc<RwLock<Option<EventSender>>>,
) where
    S: Stream<Item = ValueNotification> + Unpin + Send,
    D: FrameDecoder,
{
    while let Some(notification) = notifications.next().await {
        let fields = match decoder.decode(notification.uuid, Bytes::from(notification.value)) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("Dropping frame from {}: {}", notification.uuid, e);
                continue;
            }
        };
        if fields.is_empty() {
            continue;
        }

        let snapshot = {
            let mut values = values.write().await;
            values.extend(fields);
            TelemetrySnapshot::new(values.clone())
        };

        if let Some(tx) = sender.read().await.as_ref() {
            if tx.send(ClientEvent::Telemetry(snapshot)).is_err() {
                debug!("Telemetry receiver dropped, stopping notifications");
                break;
            }
        }
    }
}

async fn watch_disconnect<S>(
    mut events: S,
    id: PeripheralId,
    address: String,
    need_connect: Arc<AtomicBool>,
    sender: Arc<RwLock<Option<EventSender>>>,
) where
    S: Stream<Item = CentralEvent> + Unpin + Send,
{
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected != id {
                continue;
            }
            let need_connect = need_connect.load(Ordering::SeqCst);
            info!("Device {} disconnected (need_connect: {})", address, need_connect);
            if let Some(tx) = sender.read().await.as_ref() {
                if tx.send(ClientEvent::Disconnected { need_connect }).is_err() {
                    debug!("Event receiver dropped, disconnect of {} not delivered", address);
                }
            }
            break;
        }
    }
}

#[async_trait]
impl<D: FrameDecoder> AttributeSource for BleTelemetryClient<D> {
    async fn attribute(&self, key: &str) -> Result<Option<AttributeValue>> {
        Ok(self.values.read().await.get(key).cloned())
    }
}

#[async_trait]
impl<D: FrameDecoder> TelemetryClient for BleTelemetryClient<D> {
    type Device = Peripheral;

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        self.need_connect.store(true, Ordering::SeqCst);
        self.stop_tasks().await;

        let peripheral = self.peripheral.read().await.clone();
        info!("Connecting to {}", self.address);

        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|e| FtmsError::ConnectFailed {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })?;
        }
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let (data_char, machine_type) = MACHINE_DATA_CHARACTERISTICS
            .iter()
            .find_map(|(uuid, machine_type)| {
                find_characteristic(&characteristics, *uuid).map(|c| (c, *machine_type))
            })
            .ok_or_else(|| FtmsError::ProtocolMismatch {
                address: self.address.clone(),
            })?;
        *self.machine_type.write().await = Some(machine_type);

        let mut missing = Vec::new();

        let features = match find_characteristic(&characteristics, FITNESS_MACHINE_FEATURE_UUID) {
            Some(characteristic) => Some(peripheral.read(&characteristic).await?),
            None => {
                missing.push("fitness machine feature");
                None
            }
        };
        *self.capabilities.write().await =
            self.decoder.capabilities(machine_type, features.as_deref());
        *self.device_info.write().await = read_device_info(&peripheral, &characteristics).await;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&data_char).await?;
        match find_characteristic(&characteristics, TRAINING_STATUS_UUID) {
            Some(characteristic) => peripheral.subscribe(&characteristic).await?,
            None => missing.push("training status"),
        }

        let events = self.adapter.events().await?;
        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(tokio::spawn(pump_notifications(
                notifications,
                Arc::clone(&self.decoder),
                Arc::clone(&self.values),
                Arc::clone(&self.sender),
            )));
            tasks.push(tokio::spawn(watch_disconnect(
                events,
                peripheral.id(),
                self.address.clone(),
                Arc::clone(&self.need_connect),
                Arc::clone(&self.sender),
            )));
        }

        info!("Connected to {} ({})", self.address, machine_type);

        if missing.is_empty() {
            Ok(())
        } else {
            debug!("{} lacks optional characteristics: {}", self.address, missing.join(", "));
            Err(FtmsError::CharacteristicMissing(missing.join(", ")))
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.need_connect.store(false, Ordering::SeqCst);

        let peripheral = self.peripheral.read().await.clone();
        let result = if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await.map_err(FtmsError::from)
        } else {
            Ok(())
        };

        self.stop_tasks().await;
        result
    }

    async fn set_event_sender(&self, sender: EventSender) {
        *self.sender.write().await = Some(sender);
    }

    async fn available_properties(&self) -> CapabilitySet {
        self.capabilities.read().await.clone()
    }

    async fn device_info(&self) -> DeviceInfo {
        self.device_info.read().await.clone()
    }

    async fn machine_type(&self) -> Option<MachineType> {
        *self.machine_type.read().await
    }

    fn need_connect(&self) -> bool {
        self.need_connect.load(Ordering::SeqCst)
    }

    async fn update_service_info(&self, info: ServiceInfo<Peripheral>) {
        debug!("Advertisement update for {}", self.address);
        *self.peripheral.write().await = info.device;
        *self.advertisement.write().await = info.advertisement;
    }
}

impl<D> Drop for BleTelemetryClient<D> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
