//! In-memory telemetry client and discovery for tests and demos.
//!
//! [`MockTelemetryClient`] implements [`TelemetryClient`] without any
//! Bluetooth hardware. Tests drive it explicitly: push telemetry with
//! [`emit_telemetry`](MockTelemetryClient::emit_telemetry), drop the link with
//! [`drop_link`](MockTelemetryClient::drop_link), and inject connect failures
//! or latency.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::{
    client::{AttributeSource, ClientEvent, EventSender, TelemetryClient},
    discovery::{Advertisement, Discovery, ServiceInfo},
    error::{FtmsError, Result},
    types::{AttributeValue, CapabilitySet, DeviceInfo, MachineType, TelemetrySnapshot},
    FTMS_SERVICE_UUID,
};

/// Device handle handed out by [`MockDiscovery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPeripheral {
    /// Device address
    pub address: String,
}

/// A scripted FTMS telemetry client
pub struct MockTelemetryClient {
    address: String,
    machine_type: Option<MachineType>,
    capabilities: CapabilitySet,
    device_info: DeviceInfo,
    connected: AtomicBool,
    need_connect: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay)
    connect_latency_ms: AtomicU64,
    connect_errors: Mutex<VecDeque<FtmsError>>,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    service_info_updates: AtomicU32,
    values: RwLock<BTreeMap<String, AttributeValue>>,
    unreadable: RwLock<BTreeSet<String>>,
    sender: RwLock<Option<EventSender>>,
}

impl fmt::Debug for MockTelemetryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTelemetryClient")
            .field("address", &self.address)
            .field("machine_type", &self.machine_type)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("need_connect", &self.need_connect.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockTelemetryClient {
    /// Create an indoor bike with no capabilities
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            machine_type: Some(MachineType::IndoorBike),
            capabilities: CapabilitySet::new(),
            device_info: DeviceInfo {
                manufacturer: Some("Mock Fitness".to_string()),
                model: Some("Trainer 1".to_string()),
                serial_number: Some("MOCK-0001".to_string()),
                ..DeviceInfo::default()
            },
            connected: AtomicBool::new(false),
            need_connect: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            connect_errors: Mutex::new(VecDeque::new()),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            service_info_updates: AtomicU32::new(0),
            values: RwLock::new(BTreeMap::new()),
            unreadable: RwLock::new(BTreeSet::new()),
            sender: RwLock::new(None),
        }
    }

    /// Create a client for an advertised device
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ProtocolMismatch`] if the advertisement does not
    /// announce the Fitness Machine Service.
    pub fn from_service_info(info: &ServiceInfo<MockPeripheral>) -> Result<Self> {
        if !info.advertisement.is_fitness_machine() {
            return Err(FtmsError::ProtocolMismatch {
                address: info.address.clone(),
            });
        }
        Ok(Self::new(&info.address))
    }

    /// Set the reported capabilities
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set the machine type
    #[must_use]
    pub const fn with_machine_type(mut self, machine_type: MachineType) -> Self {
        self.machine_type = Some(machine_type);
        self
    }

    /// Set the device information
    #[must_use]
    pub fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    /// Delay every connect attempt
    #[must_use]
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        self.set_connect_latency(latency);
        self
    }

    /// Delay every connect attempt
    pub fn set_connect_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.connect_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Queue a connect failure before the client is shared
    #[must_use]
    pub fn with_connect_error(mut self, error: FtmsError) -> Self {
        self.connect_errors.get_mut().push_back(error);
        self
    }

    /// Make the next connect attempt fail with `error`
    ///
    /// A soft error leaves the session open, like a real client would.
    pub async fn fail_next_connect(&self, error: FtmsError) {
        self.connect_errors.lock().await.push_back(error);
    }

    /// Make reads of `key` fail
    pub async fn make_unreadable(&self, key: &str) {
        self.unreadable.write().await.insert(key.to_string());
    }

    /// Merge values into the attribute map and push the full map as telemetry
    ///
    /// Returns `false` if no event sender is attached or it was dropped.
    pub async fn emit_telemetry<I, K, V>(&self, values: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let snapshot = {
            let mut current = self.values.write().await;
            current.extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
            TelemetrySnapshot::new(current.clone())
        };
        self.send(ClientEvent::Telemetry(snapshot)).await
    }

    /// Drop the link without being asked to
    ///
    /// The event carries the current need-connect flag, so the drop is
    /// reported as unexpected while a session is wanted.
    pub async fn drop_link(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        let need_connect = self.need_connect.load(Ordering::SeqCst);
        debug!("Mock {} dropping link (need_connect: {})", self.address, need_connect);
        self.send(ClientEvent::Disconnected { need_connect }).await
    }

    async fn send(&self, event: ClientEvent) -> bool {
        self.sender
            .read()
            .await
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Whether a session is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of connect attempts so far
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls so far
    #[must_use]
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    /// Number of advertisement updates received
    #[must_use]
    pub fn service_info_updates(&self) -> u32 {
        self.service_info_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributeSource for MockTelemetryClient {
    async fn attribute(&self, key: &str) -> Result<Option<AttributeValue>> {
        if self.unreadable.read().await.contains(key) {
            return Err(FtmsError::AttributeUnavailable {
                key: key.to_string(),
                reason: "read failed".to_string(),
            });
        }
        Ok(self.values.read().await.get(key).cloned())
    }
}

#[async_trait]
impl TelemetryClient for MockTelemetryClient {
    type Device = MockPeripheral;

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.need_connect.store(true, Ordering::SeqCst);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if let Some(error) = self.connect_errors.lock().await.pop_front() {
            self.connected.store(error.is_soft(), Ordering::SeqCst);
            return Err(error);
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.need_connect.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_event_sender(&self, sender: EventSender) {
        *self.sender.write().await = Some(sender);
    }

    async fn available_properties(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn device_info(&self) -> DeviceInfo {
        self.device_info.clone()
    }

    async fn machine_type(&self) -> Option<MachineType> {
        self.machine_type
    }

    fn need_connect(&self) -> bool {
        self.need_connect.load(Ordering::SeqCst)
    }

    async fn update_service_info(&self, info: ServiceInfo<MockPeripheral>) {
        debug!("Mock {} received advertisement update", info.address);
        self.service_info_updates.fetch_add(1, Ordering::SeqCst);
    }
}

type Watcher = (String, mpsc::UnboundedSender<ServiceInfo<MockPeripheral>>);

/// Discovery backed by an in-memory table of advertisements
#[derive(Debug, Default)]
pub struct MockDiscovery {
    records: RwLock<HashMap<String, ServiceInfo<MockPeripheral>>>,
    watchers: Mutex<Vec<Watcher>>,
}

impl MockDiscovery {
    /// Create an empty discovery table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertisement record for a fitness machine at `address`
    #[must_use]
    pub fn fitness_machine(address: &str) -> ServiceInfo<MockPeripheral> {
        ServiceInfo {
            address: address.to_string(),
            device: MockPeripheral {
                address: address.to_string(),
            },
            advertisement: Advertisement {
                local_name: Some("Mock Trainer".to_string()),
                rssi: Some(-60),
                service_uuids: vec![FTMS_SERVICE_UUID],
                ..Advertisement::default()
            },
        }
    }

    /// Advertisement record for a device without the Fitness Machine Service
    #[must_use]
    pub fn other_device(address: &str) -> ServiceInfo<MockPeripheral> {
        ServiceInfo {
            address: address.to_string(),
            device: MockPeripheral {
                address: address.to_string(),
            },
            advertisement: Advertisement {
                local_name: Some("Mock Speaker".to_string()),
                ..Advertisement::default()
            },
        }
    }

    /// Add or replace a record without notifying watchers
    pub async fn insert(&self, info: ServiceInfo<MockPeripheral>) {
        self.records.write().await.insert(info.address.clone(), info);
    }

    /// Replace a record and notify watchers of its address
    ///
    /// Returns how many watchers received the update.
    pub async fn advertise(&self, info: ServiceInfo<MockPeripheral>) -> usize {
        self.insert(info.clone()).await;

        let mut watchers = self.watchers.lock().await;
        watchers.retain(|(_, tx)| !tx.is_closed());
        watchers
            .iter()
            .filter(|(address, _)| *address == info.address)
            .filter(|(_, tx)| tx.send(info.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    type Device = MockPeripheral;

    async fn service_info(&self, address: &str) -> Option<ServiceInfo<MockPeripheral>> {
        self.records.read().await.get(address).cloned()
    }

    async fn watch(
        &self,
        address: &str,
    ) -> Result<mpsc::UnboundedReceiver<ServiceInfo<MockPeripheral>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().await.push((address.to_string(), tx));
        Ok(rx)
    }
}
