use async_trait::async_trait;
use btleplug::{
    api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    FTMS_SERVICE_UUID,
};

/// Advertisement data last seen for a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Check if the advertisement announces the Fitness Machine Service
    #[must_use]
    pub fn is_fitness_machine(&self) -> bool {
        self.service_uuids.contains(&FTMS_SERVICE_UUID)
            || self.service_data.contains_key(&FTMS_SERVICE_UUID)
    }
}

/// Device handle plus its current advertisement
#[derive(Debug, Clone)]
pub struct ServiceInfo<D> {
    /// Device address
    pub address: String,
    /// Platform device handle
    pub device: D,
    /// Latest advertisement data
    pub advertisement: Advertisement,
}

/// Source of device handles and advertisement updates
///
/// Discovery itself (scanning) happens elsewhere; implementations only
/// report what is already known about an address.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Device handle type
    type Device: Clone + Send + Sync + 'static;

    /// Latest known record for an address
    async fn service_info(&self, address: &str) -> Option<ServiceInfo<Self::Device>>;

    /// Stream advertisement updates for an address
    ///
    /// The stream ends when the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the update source cannot be subscribed to.
    async fn watch(&self, address: &str)
        -> Result<mpsc::UnboundedReceiver<ServiceInfo<Self::Device>>>;
}

/// Discovery backed by the peripherals a btleplug adapter already knows about
pub struct BleDiscovery {
    adapter: Adapter,
}

impl BleDiscovery {
    /// Use the first Bluetooth adapter of the system
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NoAdapter`] if no Bluetooth adapters are available,
    /// or [`FtmsError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(FtmsError::NoAdapter)?;

        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter
    #[must_use]
    pub const fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Underlying adapter
    #[must_use]
    pub const fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find(&self, address: BDAddr) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals.into_iter().find(|p| p.address() == address))
    }
}

async fn service_info_of(peripheral: Peripheral, address: &str) -> Option<ServiceInfo<Peripheral>> {
    let properties = peripheral.properties().await.ok().flatten()?;
    Some(ServiceInfo {
        address: address.to_string(),
        advertisement: Advertisement {
            local_name: properties.local_name,
            rssi: properties.rssi,
            service_uuids: properties.services,
            service_data: properties.service_data,
            manufacturer_data: properties.manufacturer_data,
        },
        device: peripheral,
    })
}

fn parse_address(address: &str) -> Result<BDAddr> {
    address
        .parse()
        .map_err(|e| FtmsError::InvalidConfig(format!("Invalid device address {address}: {e}")))
}

#[async_trait]
impl Discovery for BleDiscovery {
    type Device = Peripheral;

    async fn service_info(&self, address: &str) -> Option<ServiceInfo<Peripheral>> {
        let target = match parse_address(address) {
            Ok(target) => target,
            Err(e) => {
                debug!("{}", e);
                return None;
            }
        };

        match self.find(target).await {
            Ok(Some(peripheral)) => service_info_of(peripheral, address).await,
            Ok(None) => None,
            Err(e) => {
                debug!("Peripheral lookup for {} failed: {}", address, e);
                None
            }
        }
    }

    async fn watch(&self, address: &str) -> Result<mpsc::UnboundedReceiver<ServiceInfo<Peripheral>>> {
        let target = parse_address(address)?;
        let mut events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let address = address.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = tx.closed() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if peripheral.address() != target {
                    continue;
                }

                if let Some(info) = service_info_of(peripheral, &address).await {
                    if tx.send(info).is_err() {
                        break;
                    }
                }
            }
            debug!("Advertisement watch for {} ended", address);
        });

        Ok(rx)
    }
}
