use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType as BtleplugWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{BlePlatform, L2capStream, PlatformEvent};
use crate::error::BleError;
use crate::model::{
    Advertisement, CharacteristicInfo, DescriptorInfo, GattStatus, PeripheralAddress, PhyPair,
    ServiceInfo, WriteType,
};

/// Platform backed by the first btleplug adapter on the host.
///
/// btleplug performs GATT calls inline, so every command runs on its own task
/// and reports its outcome as a [`PlatformEvent`].
#[derive(Debug, Clone)]
pub struct BtleplugPlatform {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    adapter: Adapter,
    sink: Mutex<Option<UnboundedSender<PlatformEvent>>>,
    peripherals: Mutex<HashMap<PeripheralAddress, Peripheral>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    notification_pumps: Mutex<HashMap<PeripheralAddress, JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }
        for (_, pump) in self.notification_pumps.lock().drain() {
            pump.abort();
        }
    }
}

impl BtleplugPlatform {
    /// Opens the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::PlatformOperationFailed`] when no adapter is present.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::platform("adapters", "no Bluetooth adapters found"))?;
        match adapter.adapter_info().await {
            Ok(name) => info!(adapter = %name, "using Bluetooth adapter"),
            Err(error) => debug!(?error, "failed to describe adapter"),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                adapter,
                sink: Mutex::new(None),
                peripherals: Mutex::new(HashMap::new()),
                event_pump: Mutex::new(None),
                notification_pumps: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Runs `operation` on a task and emits the event it produces.
    fn spawn_operation<Fut>(&self, operation: Fut)
    where
        Fut: Future<Output = PlatformEvent> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let event = operation.await;
            inner.emit(event);
        });
    }

    fn ensure_notification_pump(&self, address: &PeripheralAddress, peripheral: Peripheral) {
        let mut pumps = self.inner.notification_pumps.lock();
        if pumps.contains_key(address) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let pump_address = address.clone();
        let pump = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(notifications) => notifications,
                Err(error) => {
                    warn!(?error, address = %pump_address, "notification stream unavailable");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.emit(PlatformEvent::CharacteristicChanged {
                    address: pump_address.clone(),
                    characteristic: notification.uuid.to_string(),
                    value: notification.value,
                });
            }
            trace!(address = %pump_address, "notification stream closed");
        });
        pumps.insert(address.clone(), pump);
    }

    fn stop_notification_pump(&self, address: &PeripheralAddress) {
        if let Some(pump) = self.inner.notification_pumps.lock().remove(address) {
            pump.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: PlatformEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            if sink.send(event).is_err() {
                trace!("btleplug event sink closed");
            }
        }
    }

    fn peripheral(&self, address: &PeripheralAddress) -> Result<Peripheral, BleError> {
        self.peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::PreconditionFailed {
                address: address.clone(),
            })
    }

    async fn observe(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(error) => {
                trace!(?error, "advertising peripheral vanished");
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(error) => {
                trace!(?error, "failed to read advertisement properties");
                return;
            }
        };
        let address = address_of(&peripheral);
        self.peripherals.lock().insert(address.clone(), peripheral);

        let Some(rssi) = properties.rssi else {
            return;
        };
        let mut advertisement = Advertisement::new(address, rssi, Instant::now())
            .with_service_uuids(properties.services.iter().map(Uuid::to_string).collect());
        if let Some(name) = properties.local_name {
            advertisement = advertisement.with_local_name(name);
        }
        if let Some((company_id, data)) = properties
            .manufacturer_data
            .iter()
            .min_by_key(|(company_id, _)| **company_id)
        {
            let mut payload = company_id.to_le_bytes().to_vec();
            payload.extend_from_slice(data);
            advertisement = advertisement.with_payload(payload);
        }
        self.emit(PlatformEvent::Advertisement(advertisement));
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => self.observe(&id).await,
            CentralEvent::DeviceConnected(id) => {
                self.emit(PlatformEvent::ConnectionStateChanged {
                    address: PeripheralAddress::new(id.to_string()),
                    connected: true,
                    status: GattStatus::Success,
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                self.emit(PlatformEvent::ConnectionStateChanged {
                    address: PeripheralAddress::new(id.to_string()),
                    connected: false,
                    status: GattStatus::Unspecified,
                });
            }
            other => trace!(?other, "ignoring adapter event"),
        }
    }
}

/// Translates adapter events until the stream ends or the platform is dropped.
async fn pump_central_events(inner: Weak<Inner>) {
    let mut events = {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        match strong.adapter.events().await {
            Ok(events) => events,
            Err(error) => {
                warn!(?error, "adapter event stream unavailable");
                return;
            }
        }
    };
    while let Some(event) = events.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_central_event(event).await;
    }
    debug!("adapter event stream ended");
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    fn attach(&self, sink: UnboundedSender<PlatformEvent>) {
        *self.inner.sink.lock() = Some(sink);
        let mut pump = self.inner.event_pump.lock();
        if pump.is_none() {
            *pump = Some(tokio::spawn(pump_central_events(Arc::downgrade(&self.inner))));
        }
    }

    fn is_known_device(&self, address: &PeripheralAddress) -> bool {
        self.inner.peripherals.lock().contains_key(address)
    }

    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self, service_uuids: &[String]) -> Result<(), BleError> {
        let services = service_uuids
            .iter()
            .map(|uuid| {
                Uuid::parse_str(uuid).map_err(|error| BleError::platform("start_scan", error))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.inner.adapter.start_scan(ScanFilter { services }).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.inner.adapter.stop_scan().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn connect(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let address = address.clone();
        self.spawn_operation(async move {
            let connected = peripheral.connect().await;
            if let Err(error) = &connected {
                debug!(?error, "btleplug connect failed");
            }
            PlatformEvent::ConnectionStateChanged {
                address,
                connected: connected.is_ok(),
                status: if connected.is_ok() {
                    GattStatus::Success
                } else {
                    GattStatus::Unspecified
                },
            }
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn disconnect(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        self.stop_notification_pump(address);
        let address = address.clone();
        self.spawn_operation(async move {
            let status = match peripheral.disconnect().await {
                Ok(()) => GattStatus::Success,
                Err(error) => {
                    debug!(?error, "btleplug disconnect failed");
                    GattStatus::Unspecified
                }
            };
            PlatformEvent::ConnectionStateChanged {
                address,
                connected: false,
                status,
            }
        });
        Ok(())
    }

    async fn discover_services(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let address = address.clone();
        self.spawn_operation(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(collect_services(&peripheral)),
                Err(error) => Err(BleError::from(error)),
            };
            PlatformEvent::ServicesDiscovered { address, result }
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let address = address.clone();
        let characteristic = characteristic.to_string();
        self.spawn_operation(async move {
            let result = peripheral.read(&target).await.map_err(BleError::from);
            PlatformEvent::CharacteristicRead {
                address,
                characteristic,
                result,
            }
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let address = address.clone();
        let characteristic = characteristic.to_string();
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtleplugWriteType::WithResponse,
            WriteType::WithoutResponse => BtleplugWriteType::WithoutResponse,
        };
        self.spawn_operation(async move {
            let result = peripheral
                .write(&target, &value, write_type)
                .await
                .map_err(BleError::from);
            PlatformEvent::CharacteristicWritten {
                address,
                characteristic,
                result,
            }
        });
        Ok(())
    }

    async fn read_descriptor(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let target = find_descriptor(&peripheral, characteristic, descriptor)?;
        let address = address.clone();
        let characteristic = characteristic.to_string();
        let descriptor = descriptor.to_string();
        self.spawn_operation(async move {
            let result = peripheral
                .read_descriptor(&target)
                .await
                .map_err(BleError::from);
            PlatformEvent::DescriptorRead {
                address,
                characteristic,
                descriptor,
                result,
            }
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
        value: &[u8],
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let target = find_descriptor(&peripheral, characteristic, descriptor)?;
        let address = address.clone();
        let characteristic = characteristic.to_string();
        let descriptor = descriptor.to_string();
        let value = value.to_vec();
        self.spawn_operation(async move {
            let result = peripheral
                .write_descriptor(&target, &value)
                .await
                .map_err(BleError::from);
            PlatformEvent::DescriptorWritten {
                address,
                characteristic,
                descriptor,
                result,
            }
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        enabled: bool,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        if enabled {
            self.ensure_notification_pump(address, peripheral.clone());
        }
        let address = address.clone();
        let characteristic = characteristic.to_string();
        self.spawn_operation(async move {
            let outcome = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            PlatformEvent::NotifyStateChanged {
                address,
                characteristic,
                result: outcome.map(|()| enabled).map_err(BleError::from),
            }
        });
        Ok(())
    }

    async fn read_rssi(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(address)?;
        let address = address.clone();
        self.spawn_operation(async move {
            let result = match peripheral.properties().await {
                Ok(properties) => properties
                    .and_then(|properties| properties.rssi)
                    .ok_or_else(|| BleError::platform("read_rssi", "no RSSI reported")),
                Err(error) => Err(BleError::from(error)),
            };
            PlatformEvent::RssiRead { address, result }
        });
        Ok(())
    }

    async fn request_mtu(&self, _address: &PeripheralAddress, _mtu: u16) -> Result<(), BleError> {
        Err(unsupported("request_mtu"))
    }

    async fn read_phy(&self, _address: &PeripheralAddress) -> Result<(), BleError> {
        Err(unsupported("read_phy"))
    }

    async fn set_preferred_phy(
        &self,
        _address: &PeripheralAddress,
        _phy: PhyPair,
    ) -> Result<(), BleError> {
        Err(unsupported("set_preferred_phy"))
    }

    async fn execute_reliable_write(&self, _address: &PeripheralAddress) -> Result<(), BleError> {
        Err(unsupported("execute_reliable_write"))
    }

    async fn open_l2cap(
        &self,
        _address: &PeripheralAddress,
        _psm: u16,
        _secure: bool,
    ) -> Result<L2capStream, BleError> {
        Err(unsupported("open_l2cap"))
    }
}

fn unsupported(operation: &str) -> BleError {
    BleError::platform(operation, "not supported by the btleplug backend")
}

fn address_of(peripheral: &Peripheral) -> PeripheralAddress {
    PeripheralAddress::new(peripheral.id().to_string())
}

fn find_characteristic(peripheral: &Peripheral, uuid: &str) -> Result<Characteristic, BleError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid.to_string().eq_ignore_ascii_case(uuid))
        .ok_or_else(|| BleError::platform("characteristic", format!("`{uuid}` was not discovered")))
}

fn find_descriptor(
    peripheral: &Peripheral,
    characteristic: &str,
    descriptor: &str,
) -> Result<btleplug::api::Descriptor, BleError> {
    find_characteristic(peripheral, characteristic)?
        .descriptors
        .into_iter()
        .find(|candidate| candidate.uuid.to_string().eq_ignore_ascii_case(descriptor))
        .ok_or_else(|| {
            BleError::platform(
                "descriptor",
                format!("`{descriptor}` was not discovered on `{characteristic}`"),
            )
        })
}

fn collect_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let mut characteristics: Vec<CharacteristicInfo> = service
                .characteristics
                .iter()
                .map(|characteristic| {
                    let descriptors = characteristic
                        .descriptors
                        .iter()
                        .map(|descriptor| DescriptorInfo::new(descriptor.uuid.to_string()))
                        .collect();
                    CharacteristicInfo::new(
                        characteristic.uuid.to_string(),
                        property_labels(characteristic.properties),
                    )
                    .with_descriptors(descriptors)
                })
                .collect();
            characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));
            ServiceInfo::new(service.uuid.to_string(), service.primary, characteristics)
        })
        .collect();
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}
