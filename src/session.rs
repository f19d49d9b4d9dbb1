//! Device session orchestration.
//!
//! [`FtmsSession`] wires one telemetry client to a [`ConnectionManager`], a
//! [`DataCoordinator`], a [`ReconnectScheduler`] and a [`SensorValueResolver`],
//! and owns the background tasks that connect them.

use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{event_channel, TelemetryClient},
    config::FtmsConfig,
    connection::{ConnectionManager, LinkLoss},
    coordinator::{DataCoordinator, LinkObserver},
    discovery::{Discovery, ServiceInfo},
    error::{FtmsError, NotReady, Result},
    reconnect::ReconnectScheduler,
    sensor::{select_sensors, SensorDescriptor, SensorReading, SensorValueResolver},
    types::{CapabilitySet, ConnectionState, DeviceInfo, MachineType, TelemetrySnapshot},
};

struct SessionInner<C> {
    config: FtmsConfig,
    unique_id: String,
    device_info: DeviceInfo,
    machine_type: Option<MachineType>,
    capabilities: CapabilitySet,
    sensors: Vec<&'static SensorDescriptor>,
    manager: Arc<ConnectionManager<C>>,
    coordinator: Arc<DataCoordinator<C>>,
    scheduler: ReconnectScheduler,
    shutdown: CancellationToken,
    this: Weak<Self>,
}

impl<C: TelemetryClient + 'static> SessionInner<C> {
    async fn reconnect(&self) {
        match self
            .manager
            .connect(self.config.connection.connect_timeout())
            .await
        {
            Ok(_) => {
                self.coordinator.mark_connected();
            }
            Err(e) => warn!("Reconnect to {} failed: {}", self.config.address, e),
        }
    }
}

#[async_trait]
impl<C: TelemetryClient + 'static> LinkObserver for SessionInner<C> {
    async fn on_link_lost(&self, need_connect: bool) {
        let loss = self.manager.link_lost(need_connect).await;
        self.coordinator.connection_lost();

        if loss == LinkLoss::Intentional {
            self.scheduler.cancel().await;
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        debug!("Device disconnected, scheduling reconnection...");
        let session = self.this.clone();
        self.scheduler
            .schedule(move || async move {
                if let Some(session) = session.upgrade() {
                    session.reconnect().await;
                }
            })
            .await;
    }

    async fn on_link_restored(&self) {
        if self.scheduler.cancel().await {
            debug!("Link to {} is back, pending reconnect dropped", self.config.address);
        }
        self.manager.link_restored().await;
    }
}

/// A live link to one configured fitness machine
pub struct FtmsSession<C> {
    inner: Arc<SessionInner<C>>,
    readings: watch::Receiver<Arc<[SensorReading]>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C: TelemetryClient + 'static> FtmsSession<C> {
    /// Connect to the configured device and start serving its telemetry
    ///
    /// `make_client` builds the protocol client from the last advertisement
    /// discovery knows for the address.
    ///
    /// A device that lacks an optional characteristic is still set up. Sensors
    /// the device does not report are dropped from the selection with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns [`NotReady`] when the configuration is invalid, discovery has
    /// no record of the device, the device is not a fitness machine, or the
    /// connect attempt times out or fails. The caller decides whether to retry.
    pub async fn setup<D, F>(
        config: FtmsConfig,
        discovery: &D,
        make_client: F,
    ) -> std::result::Result<Self, NotReady>
    where
        D: Discovery<Device = C::Device> + ?Sized,
        F: FnOnce(ServiceInfo<C::Device>) -> Result<C>,
    {
        let address = config.address.clone();
        let not_ready = |e: FtmsError| NotReady::new(address.clone(), e);

        config.validate().map_err(not_ready)?;

        let info = discovery.service_info(&address).await.ok_or_else(|| {
            not_ready(FtmsError::DeviceNotFound {
                address: address.clone(),
            })
        })?;

        let client = Arc::new(make_client(info).map_err(not_ready)?);
        let (events_tx, events_rx) = event_channel();
        client.set_event_sender(events_tx).await;

        let manager = Arc::new(ConnectionManager::new(Arc::clone(&client)));
        let outcome = manager
            .connect(config.connection.connect_timeout())
            .await
            .map_err(not_ready)?;
        debug!("Connect outcome for {}: {:?}", address, outcome);

        let device_info = client.device_info().await;
        let machine_type = client.machine_type().await;
        let capabilities = client.available_properties().await;
        debug!("Device Information: {:?}", device_info);
        debug!("Machine type: {:?}", machine_type);
        debug!("Available sensors: {}", capabilities);

        let unique_id = device_info.unique_id(&address);
        debug!("Registered new FTMS device. UniqueID is '{}'", unique_id);

        let sensors = select_sensors(&config.sensors, &capabilities);
        let coordinator = Arc::new(DataCoordinator::new(Arc::clone(&manager), &config.connection));
        let shutdown = CancellationToken::new();
        let scheduler =
            ReconnectScheduler::with_shutdown(config.connection.reconnect_delay(), shutdown.clone());

        let inner = Arc::new_cyclic(|this| SessionInner {
            config,
            unique_id,
            device_info,
            machine_type,
            capabilities,
            sensors,
            manager,
            coordinator,
            scheduler,
            shutdown,
            this: this.clone(),
        });

        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let shutdown = inner.shutdown.clone();
                inner
                    .coordinator
                    .run(events_rx, inner.as_ref(), shutdown)
                    .await;
            }
        }));

        let resolver = SensorValueResolver::new(inner.sensors.clone());
        let (readings, resolver_task) = resolver.spawn(inner.coordinator.subscribe());
        tasks.push(resolver_task);

        match discovery.watch(&address).await {
            Ok(updates) => tasks.push(tokio::spawn(forward_advertisements(
                updates,
                client,
                inner.shutdown.clone(),
            ))),
            Err(e) => warn!("Cannot follow advertisements of {}: {}", address, e),
        }

        info!(
            "FTMS device {} ready with {} sensors",
            address,
            inner.sensors.len()
        );

        Ok(Self {
            inner,
            readings,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop all tasks, drop any pending reconnect and close the link
    ///
    /// Only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns the error reported while closing the link.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down {}", self.address());
        self.inner.scheduler.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let result = self.inner.manager.disconnect().await;
        self.inner.coordinator.connection_lost();
        result
    }

    /// Whether `config` differs enough to require [`reload`](Self::reload)
    #[must_use]
    pub fn needs_reload(&self, config: &FtmsConfig) -> bool {
        self.inner.config.requires_reload(config)
    }

    /// Apply a new configuration
    ///
    /// Returns `self` unchanged when nothing relevant changed, otherwise tears
    /// the session down and sets up a new one.
    ///
    /// # Errors
    ///
    /// Returns [`NotReady`] if the new session cannot be set up.
    pub async fn reload<D, F>(
        self,
        config: FtmsConfig,
        discovery: &D,
        make_client: F,
    ) -> std::result::Result<Self, NotReady>
    where
        D: Discovery<Device = C::Device> + ?Sized,
        F: FnOnce(ServiceInfo<C::Device>) -> Result<C>,
    {
        if !self.needs_reload(&config) {
            debug!("Configuration of {} unchanged", self.address());
            return Ok(self);
        }

        info!("Configuration of {} changed, reloading", self.address());
        if let Err(e) = self.shutdown().await {
            debug!("Error while closing {} for reload: {}", self.address(), e);
        }
        drop(self);

        Self::setup(config, discovery, make_client).await
    }

    /// Configuration the session was set up with
    #[must_use]
    pub fn config(&self) -> &FtmsConfig {
        &self.inner.config
    }

    /// Device address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    /// Stable identifier derived from the serial number or address
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.inner.unique_id
    }

    /// Identity read during setup
    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        &self.inner.device_info
    }

    /// Machine kind detected during setup
    #[must_use]
    pub fn machine_type(&self) -> Option<MachineType> {
        self.inner.machine_type
    }

    /// Metrics the device reported during setup
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.inner.capabilities
    }

    /// Effective sensor selection
    #[must_use]
    pub fn sensors(&self) -> &[&'static SensorDescriptor] {
        &self.inner.sensors
    }

    /// The protocol client
    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        self.inner.manager.client()
    }

    /// Current readings of the selected sensors
    #[must_use]
    pub fn readings(&self) -> Arc<[SensorReading]> {
        Arc::clone(&self.readings.borrow())
    }

    /// Receive reading updates
    #[must_use]
    pub fn subscribe_readings(&self) -> watch::Receiver<Arc<[SensorReading]>> {
        self.readings.clone()
    }

    /// Latest telemetry snapshot, served even while disconnected
    #[must_use]
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        self.inner.coordinator.snapshot()
    }

    /// Connected flag as seen by consumers
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.coordinator.is_connected()
    }

    /// Receive connected flag changes
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.inner.coordinator.subscribe_connection()
    }

    /// Lifecycle state of the link
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Receive lifecycle state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.subscribe()
    }

    /// Whether a reconnect is waiting for its delay
    pub async fn reconnect_pending(&self) -> bool {
        self.inner.scheduler.is_pending().await
    }
}

async fn forward_advertisements<C: TelemetryClient>(
    mut updates: tokio::sync::mpsc::UnboundedReceiver<ServiceInfo<C::Device>>,
    client: Arc<C>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Some(info) => client.update_service_info(info).await,
                None => break,
            },
        }
    }
}

impl<C> Drop for FtmsSession<C> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::NotReadyReason,
        mock::{MockDiscovery, MockTelemetryClient},
    };
    use std::time::Duration;
    use tokio::time::sleep;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn discovery() -> MockDiscovery {
        let discovery = MockDiscovery::new();
        discovery.insert(MockDiscovery::fitness_machine(ADDRESS)).await;
        discovery
    }

    fn bike(info: &ServiceInfo<crate::mock::MockPeripheral>) -> Result<MockTelemetryClient> {
        Ok(MockTelemetryClient::from_service_info(info)?.with_capabilities([
            "power_output",
            "cadence",
            "training_status",
        ]))
    }

    fn config(sensors: &[&str]) -> FtmsConfig {
        let mut config = FtmsConfig::new(ADDRESS, sensors.iter().copied());
        config.connection.poll_interval_ms = 1_000;
        config
    }

    #[tokio::test]
    async fn test_setup_requires_discovery_record() {
        let discovery = MockDiscovery::new();
        let error = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .err()
            .unwrap();
        assert_eq!(error.reason, NotReadyReason::DeviceNotFound);
        assert_eq!(error.address, ADDRESS);
    }

    #[tokio::test]
    async fn test_setup_rejects_non_fitness_machine() {
        let discovery = MockDiscovery::new();
        discovery.insert(MockDiscovery::other_device(ADDRESS)).await;

        let error = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .err()
            .unwrap();
        assert_eq!(error.reason, NotReadyReason::ProtocolMismatch);
        assert_eq!(error.reason.code(), "ftms_error");
    }

    #[tokio::test]
    async fn test_setup_rejects_invalid_config() {
        let discovery = discovery().await;
        let error = FtmsSession::setup(FtmsConfig::new(" ", ["cadence"]), &discovery, |info| {
            bike(&info)
        })
        .await
        .err()
        .unwrap();
        assert_eq!(error.reason, NotReadyReason::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_setup_fails_on_hard_connect_error() {
        let discovery = discovery().await;
        let error = FtmsSession::setup(config(&["cadence"]), &discovery, |info| {
            Ok(bike(&info)?.with_connect_error(FtmsError::NotConnected))
        })
        .await
        .err()
        .unwrap();
        assert_eq!(error.reason, NotReadyReason::ConnectionFailed);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_setup_continues_without_optional_characteristic() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["cadence", "training_status"]), &discovery, |info| {
            Ok(bike(&info)?
                .with_connect_error(FtmsError::CharacteristicMissing("training status".into())))
        })
        .await
        .unwrap();

        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(session.is_connected());
        assert_eq!(session.sensors().len(), 2);
        assert_eq!(session.unique_id(), "mock0001");
        assert_eq!(session.machine_type(), Some(MachineType::IndoorBike));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_readings_follow_telemetry() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["power_output", "heart_rate"]), &discovery, |info| {
            bike(&info)
        })
        .await
        .unwrap();

        let keys: Vec<_> = session.sensors().iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["power_output"]);

        let mut readings = session.subscribe_readings();
        readings.borrow_and_update();
        assert!(session.client().emit_telemetry([("power_output", 120_i64)]).await);

        tokio::time::timeout(Duration::from_secs(1), readings.changed())
            .await
            .unwrap()
            .unwrap();
        let current = session.readings();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].to_string(), "power_output: 120 W");

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_loss_schedules_reconnect() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(
            FtmsConfig::new(ADDRESS, ["cadence"]),
            &discovery,
            |info| bike(&info),
        )
        .await
        .unwrap();
        let client = Arc::clone(session.client());

        client.drop_link().await;
        sleep(Duration::from_millis(100)).await;
        assert!(!session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Reconnecting);
        assert!(session.reconnect_pending().await);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(client.connect_count(), 2);
        assert!(session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_intentional_disconnect_does_not_reconnect() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(
            FtmsConfig::new(ADDRESS, ["cadence"]),
            &discovery,
            |info| bike(&info),
        )
        .await
        .unwrap();
        let client = Arc::clone(session.client());

        client.disconnect().await.unwrap();
        client.drop_link().await;
        sleep(Duration::from_millis(100)).await;
        assert!(!session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.reconnect_pending().await);

        // Past the first 30s poll: the link stays down
        sleep(Duration::from_secs(31)).await;
        assert_eq!(client.connect_count(), 1);
        assert!(!session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_during_reconnect_delay_restores_link() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(
            FtmsConfig::new(ADDRESS, ["cadence"]),
            &discovery,
            |info| bike(&info),
        )
        .await
        .unwrap();
        let client = Arc::clone(session.client());

        client.drop_link().await;
        sleep(Duration::from_millis(100)).await;
        assert!(session.reconnect_pending().await);

        assert!(client.emit_telemetry([("cadence", 90_i64)]).await);
        sleep(Duration::from_millis(10)).await;
        assert!(session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(!session.reconnect_pending().await);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(client.connect_count(), 1);

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_restore_cancels_pending_reconnect() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .unwrap();
        let client = Arc::clone(session.client());

        client.drop_link().await;
        sleep(Duration::from_millis(100)).await;
        assert!(session.reconnect_pending().await);

        // Poll fires at t=1s, well before the 5s reconnect delay
        sleep(Duration::from_secs(1)).await;
        assert!(session.is_connected());
        assert!(!session.reconnect_pending().await);
        assert_eq!(client.connect_count(), 2);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(client.connect_count(), 2);

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_cancels_reconnect() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(
            FtmsConfig::new(ADDRESS, ["cadence"]),
            &discovery,
            |info| bike(&info),
        )
        .await
        .unwrap();
        let client = Arc::clone(session.client());

        client.drop_link().await;
        sleep(Duration::from_millis(100)).await;
        assert!(session.reconnect_pending().await);

        tokio_test::assert_ok!(session.shutdown().await);
        tokio_test::assert_ok!(session.shutdown().await);
        assert_eq!(client.disconnect_count(), 1);
        assert!(!session.reconnect_pending().await);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(client.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_of_live_link_clears_connected_flag() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .unwrap();
        let mut connected = session.subscribe_connection();
        assert!(*connected.borrow_and_update());

        session.shutdown().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(connected.has_changed().unwrap());
        assert!(!*connected.borrow_and_update());
    }

    #[tokio::test]
    async fn test_advertisements_reach_client() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .unwrap();

        assert_eq!(discovery.advertise(MockDiscovery::fitness_machine(ADDRESS)).await, 1);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(session.client().service_info_updates(), 1);
        assert_eq!(session.client().connect_count(), 1);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_only_when_config_changes() {
        let discovery = discovery().await;
        let session = FtmsSession::setup(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .unwrap();
        let first_client = Arc::clone(session.client());

        assert!(!session.needs_reload(&config(&["cadence"])));
        let session = session
            .reload(config(&["cadence"]), &discovery, |info| bike(&info))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first_client, session.client()));

        let updated = config(&["cadence", "power_output"]);
        assert!(session.needs_reload(&updated));
        let session = session
            .reload(updated, &discovery, |info| bike(&info))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first_client, session.client()));
        assert_eq!(session.sensors().len(), 2);
        assert_eq!(first_client.disconnect_count(), 1);

        session.shutdown().await.unwrap();
    }
}
