use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};

use super::state::{ConnectionEvent, ConnectionState};
use crate::cache::PeripheralCache;
use crate::config::CentralConfig;
use crate::error::BleError;
use crate::gatt::{
    Completion, DiscoverServices, ExecuteReliableWrite, GattCallbackRegistry, Handler,
    OperationFamily, ReadCharacteristic, ReadDescriptor, ReadPhy, ReadRssi, RequestMtu, SetNotify,
    SetPreferredPhy, WriteCharacteristic, WriteDescriptor, operation_key,
};
use crate::hw::{BlePlatform, PlatformEvent};
use crate::model::{GattStatus, Peripheral, PeripheralAddress, PhyPair, ServiceInfo, WriteType};
use crate::permissions::{Permission, PermissionChecker};
use crate::timer::TimerPool;

const CONNECT_OPERATION: &str = "Connect";
const DISCONNECT_OPERATION: &str = "Disconnect";
const DATA_CHANGED_OPERATION: &str = "DataChanged";

/// Invoked once the link is up.
pub type ConnectedCallback = Box<dyn FnOnce(Arc<Peripheral>) + Send>;
/// Invoked once the link or attempt is over; `None` means a clean end.
pub type DisconnectedCallback = Box<dyn FnOnce(Option<BleError>) + Send>;

struct ConnectAttempt {
    on_connected: ConnectedCallback,
    on_disconnected: DisconnectedCallback,
}

#[derive(Default)]
struct DeviceState {
    connection_state: ConnectionState,
    /// A platform link handle exists for the address.
    link_open: bool,
    pending_connect: Option<ConnectAttempt>,
    session_disconnected: Option<DisconnectedCallback>,
    pending_disconnects: Vec<DisconnectedCallback>,
    disconnect_requested: bool,
}

struct DeviceSlot {
    registry: GattCallbackRegistry,
    state: Mutex<DeviceState>,
}

/// Why a link is being torn down.
#[derive(Debug)]
enum Teardown {
    LinkLost(GattStatus),
    ConnectFailed(BleError),
    ConnectTimedOut(BleError),
    DisconnectFailed(BleError),
}

struct Shared {
    platform: Arc<dyn BlePlatform>,
    cache: Arc<PeripheralCache>,
    permissions: Arc<dyn PermissionChecker>,
    timers: TimerPool,
    config: CentralConfig,
    devices: Mutex<HashMap<PeripheralAddress, Arc<DeviceSlot>>>,
}

/// Per-address connection lifecycle and GATT operation dispatch.
///
/// Caller requests and platform events for one address serialize on that
/// address's state lock; different addresses never contend beyond the brief
/// device-map lookup.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("platform", &self.shared.platform)
            .field("devices", &self.shared.devices.lock().len())
            .finish_non_exhaustive()
    }
}

/// Resolves when a connected session ends.
#[derive(Debug)]
pub struct DisconnectSignal {
    receiver: oneshot::Receiver<Option<BleError>>,
}

impl DisconnectSignal {
    /// Waits for the end of the session and returns its error, if any.
    pub async fn wait(self) -> Option<BleError> {
        self.receiver.await.unwrap_or(None)
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        cache: Arc<PeripheralCache>,
        permissions: Arc<dyn PermissionChecker>,
        timers: TimerPool,
        config: CentralConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                cache,
                permissions,
                timers,
                config,
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CentralConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn connection_state(&self, address: &PeripheralAddress) -> ConnectionState {
        self.existing_slot(address)
            .map_or(ConnectionState::Undetermined, |slot| {
                slot.state.lock().connection_state
            })
    }

    /// Current cached snapshot of a peripheral.
    #[must_use]
    pub fn peripheral(&self, address: &PeripheralAddress) -> Option<Arc<Peripheral>> {
        self.shared.cache.get(address)
    }

    /// Starts connecting to `address`.
    ///
    /// Exactly one of two things happens: `on_connected` followed later by one
    /// `on_disconnected` call, or a single `on_disconnected(Some(error))`.
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self, on_connected, on_disconnected), level = "debug", fields(%address))]
    pub fn connect<C, D>(
        &self,
        address: &PeripheralAddress,
        timeout: Duration,
        on_connected: C,
        on_disconnected: D,
    ) where
        C: FnOnce(Arc<Peripheral>) + Send + 'static,
        D: FnOnce(Option<BleError>) + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.permissions.check(Permission::Connect).is_granted() {
            on_disconnected(Some(BleError::InsufficientPermissions {
                permission: Permission::Connect.to_string(),
            }));
            return;
        }
        if !shared.platform.is_known_device(address) {
            debug!("connect rejected: unknown device");
            on_disconnected(Some(BleError::PreconditionFailed {
                address: address.clone(),
            }));
            return;
        }

        let slot = self.slot(address);
        let watchdog_id = operation_key(address, CONNECT_OPERATION, None);
        {
            let mut state = slot.state.lock();
            if state.link_open || shared.timers.find_active_timer(&watchdog_id) {
                drop(state);
                debug!("connect rejected: link already open");
                on_disconnected(Some(BleError::AlreadyConnected {
                    address: address.clone(),
                }));
                return;
            }

            state.link_open = true;
            state.disconnect_requested = false;
            state.pending_connect = Some(ConnectAttempt {
                on_connected: Box::new(on_connected),
                on_disconnected: Box::new(on_disconnected),
            });
            let next = state.connection_state.on(ConnectionEvent::ConnectRequested);
            self.set_state(address, &mut state, next);

            let weak = Arc::downgrade(shared);
            let timed_out = address.clone();
            shared.timers.start_timer(watchdog_id.clone(), timeout, false, move || {
                if let Some(manager) = Self::upgrade(&weak) {
                    manager.on_connect_timeout(&timed_out, timeout);
                }
            });
        }

        info!("connecting");
        let manager = self.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.shared.platform.connect(&address).await {
                manager.shared.timers.cancel_timer(&watchdog_id);
                manager.teardown(&address, Teardown::ConnectFailed(error));
            }
        });
    }

    /// Disconnects `address`. Disconnecting an address without a link
    /// completes immediately with `None`.
    #[instrument(skip(self, on_disconnected), level = "debug", fields(%address))]
    pub fn disconnect<D>(&self, address: &PeripheralAddress, on_disconnected: D)
    where
        D: FnOnce(Option<BleError>) + Send + 'static,
    {
        let Some(slot) = self.existing_slot(address) else {
            on_disconnected(None);
            return;
        };
        let shared = &self.shared;
        {
            let mut state = slot.state.lock();
            if !state.link_open {
                drop(state);
                on_disconnected(None);
                return;
            }
            state.pending_disconnects.push(Box::new(on_disconnected));
            if state.disconnect_requested {
                trace!("joining in-progress disconnect");
                return;
            }

            state.disconnect_requested = true;
            let next = state.connection_state.on(ConnectionEvent::DisconnectRequested);
            self.set_state(address, &mut state, next);
            shared
                .timers
                .cancel_timer(&operation_key(address, CONNECT_OPERATION, None));

            let weak = Arc::downgrade(shared);
            let timed_out = address.clone();
            let timeout = shared.config.disconnect_timeout;
            shared.timers.start_timer(
                operation_key(address, DISCONNECT_OPERATION, None),
                timeout,
                false,
                move || {
                    if let Some(manager) = Self::upgrade(&weak) {
                        let operation = operation_key(&timed_out, DISCONNECT_OPERATION, None);
                        warn!(address = %timed_out, "disconnect timed out");
                        manager.teardown(
                            &timed_out,
                            Teardown::DisconnectFailed(BleError::timeout(operation, timeout)),
                        );
                    }
                },
            );
        }

        let manager = self.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.shared.platform.disconnect(&address).await {
                manager.teardown(&address, Teardown::DisconnectFailed(error));
            }
        });
    }

    /// Installs the persistent connection-state handler for `address`.
    pub fn set_connection_state_handler(
        &self,
        address: &PeripheralAddress,
        handler: Option<Handler<ConnectionState>>,
    ) {
        self.slot(address).registry.set_connection_state_handler(handler);
    }

    /// Installs the persistent service-changed handler for `address`.
    pub fn set_service_changed_handler(
        &self,
        address: &PeripheralAddress,
        handler: Option<Handler<()>>,
    ) {
        self.slot(address).registry.set_service_changed_handler(handler);
    }

    pub fn discover_services<F>(&self, address: &PeripheralAddress, on_result: F)
    where
        F: FnOnce(Result<Vec<ServiceInfo>, BleError>) + Send + 'static,
    {
        let key = operation_key(address, DiscoverServices::OPERATION, None);
        self.issue::<DiscoverServices, _, _>(
            address,
            key,
            Box::new(on_result),
            |platform, address| async move {
                platform.discover_services(&address).await
            },
        );
    }

    pub fn read_characteristic<F>(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        on_result: F,
    ) where
        F: FnOnce(Result<Vec<u8>, BleError>) + Send + 'static,
    {
        let characteristic = characteristic.to_ascii_lowercase();
        let key = operation_key(address, ReadCharacteristic::OPERATION, Some(&characteristic));
        self.issue::<ReadCharacteristic, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.read_characteristic(&address, &characteristic).await
            },
        );
    }

    pub fn write_characteristic<F>(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        value: Vec<u8>,
        write_type: WriteType,
        on_result: F,
    ) where
        F: FnOnce(Result<(), BleError>) + Send + 'static,
    {
        let characteristic = characteristic.to_ascii_lowercase();
        let key = operation_key(address, WriteCharacteristic::OPERATION, Some(&characteristic));
        self.issue::<WriteCharacteristic, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.write_characteristic(&address, &characteristic, &value, write_type).await
            },
        );
    }

    pub fn read_descriptor<F>(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
        on_result: F,
    ) where
        F: FnOnce(Result<Vec<u8>, BleError>) + Send + 'static,
    {
        let characteristic = characteristic.to_ascii_lowercase();
        let descriptor = descriptor.to_ascii_lowercase();
        let key = descriptor_key(address, ReadDescriptor::OPERATION, &characteristic, &descriptor);
        self.issue::<ReadDescriptor, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.read_descriptor(&address, &characteristic, &descriptor).await
            },
        );
    }

    pub fn write_descriptor<F>(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
        value: Vec<u8>,
        on_result: F,
    ) where
        F: FnOnce(Result<(), BleError>) + Send + 'static,
    {
        let characteristic = characteristic.to_ascii_lowercase();
        let descriptor = descriptor.to_ascii_lowercase();
        let key = descriptor_key(address, WriteDescriptor::OPERATION, &characteristic, &descriptor);
        self.issue::<WriteDescriptor, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.write_descriptor(&address, &characteristic, &descriptor, &value).await
            },
        );
    }

    /// Enables or disables notifications. While enabled, every value change
    /// for the characteristic is passed to `on_data_changed`.
    pub fn set_notify<F>(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        enabled: bool,
        on_data_changed: Option<Handler<Vec<u8>>>,
        on_result: F,
    ) where
        F: FnOnce(Result<bool, BleError>) + Send + 'static,
    {
        let characteristic = characteristic.to_ascii_lowercase();
        let data_key = operation_key(address, DATA_CHANGED_OPERATION, Some(&characteristic));
        if let Some(slot) = self.existing_slot(address) {
            match (enabled, on_data_changed) {
                (true, Some(handler)) => slot.registry.set_data_changed_handler(data_key, handler),
                (false, _) => {
                    slot.registry.remove_data_changed_handler(&data_key);
                }
                (true, None) => {}
            }
        }

        let key = operation_key(address, SetNotify::OPERATION, Some(&characteristic));
        self.issue::<SetNotify, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.set_notify(&address, &characteristic, enabled).await
            },
        );
    }

    pub fn read_rssi<F>(&self, address: &PeripheralAddress, on_result: F)
    where
        F: FnOnce(Result<i16, BleError>) + Send + 'static,
    {
        let key = operation_key(address, ReadRssi::OPERATION, None);
        self.issue::<ReadRssi, _, _>(
            address,
            key,
            Box::new(on_result),
            |platform, address| async move {
                platform.read_rssi(&address).await
            },
        );
    }

    pub fn request_mtu<F>(&self, address: &PeripheralAddress, mtu: u16, on_result: F)
    where
        F: FnOnce(Result<u16, BleError>) + Send + 'static,
    {
        let key = operation_key(address, RequestMtu::OPERATION, None);
        self.issue::<RequestMtu, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.request_mtu(&address, mtu).await
            },
        );
    }

    pub fn read_phy<F>(&self, address: &PeripheralAddress, on_result: F)
    where
        F: FnOnce(Result<PhyPair, BleError>) + Send + 'static,
    {
        let key = operation_key(address, ReadPhy::OPERATION, None);
        self.issue::<ReadPhy, _, _>(
            address,
            key,
            Box::new(on_result),
            |platform, address| async move {
                platform.read_phy(&address).await
            },
        );
    }

    pub fn set_preferred_phy<F>(&self, address: &PeripheralAddress, phy: PhyPair, on_result: F)
    where
        F: FnOnce(Result<PhyPair, BleError>) + Send + 'static,
    {
        let key = operation_key(address, SetPreferredPhy::OPERATION, None);
        self.issue::<SetPreferredPhy, _, _>(
            address,
            key,
            Box::new(on_result),
            move |platform, address| async move {
                platform.set_preferred_phy(&address, phy).await
            },
        );
    }

    pub fn execute_reliable_write<F>(&self, address: &PeripheralAddress, on_result: F)
    where
        F: FnOnce(Result<(), BleError>) + Send + 'static,
    {
        let key = operation_key(address, ExecuteReliableWrite::OPERATION, None);
        self.issue::<ExecuteReliableWrite, _, _>(
            address,
            key,
            Box::new(on_result),
            |platform, address| async move {
                platform.execute_reliable_write(&address).await
            },
        );
    }

    /// Connects and waits for the link, using the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns the error the attempt ended with.
    pub async fn connect_async(
        &self,
        address: &PeripheralAddress,
    ) -> Result<(Arc<Peripheral>, DisconnectSignal), BleError> {
        let (connected_tx, connected_rx) = oneshot::channel();
        let (disconnected_tx, disconnected_rx) = oneshot::channel();
        self.connect(
            address,
            self.shared.config.connect_timeout,
            move |peripheral| {
                let _ = connected_tx.send(peripheral);
            },
            move |error| {
                let _ = disconnected_tx.send(error);
            },
        );

        match connected_rx.await {
            Ok(peripheral) => Ok((
                peripheral,
                DisconnectSignal {
                    receiver: disconnected_rx,
                },
            )),
            Err(_) => Err(disconnected_rx.await.ok().flatten().unwrap_or_else(|| {
                BleError::platform("connect", "attempt dropped without an outcome")
            })),
        }
    }

    /// Disconnects and waits for the link to close.
    ///
    /// # Errors
    ///
    /// Returns the error reported for the disconnect, such as a timeout.
    pub async fn disconnect_async(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        self.disconnect(address, move |error| {
            let _ = tx.send(error);
        });
        match rx.await {
            Ok(Some(error)) => Err(error),
            Ok(None) | Err(_) => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn discover_services_async(
        &self,
        address: &PeripheralAddress,
    ) -> Result<Vec<ServiceInfo>, BleError> {
        await_completion(|completion| self.discover_services(address, completion)).await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn read_characteristic_async(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
    ) -> Result<Vec<u8>, BleError> {
        await_completion(|completion| self.read_characteristic(address, characteristic, completion))
            .await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn write_characteristic_async(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), BleError> {
        await_completion(|completion| {
            self.write_characteristic(address, characteristic, value, write_type, completion);
        })
        .await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn read_descriptor_async(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<Vec<u8>, BleError> {
        await_completion(|completion| {
            self.read_descriptor(address, characteristic, descriptor, completion);
        })
        .await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn write_descriptor_async(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        await_completion(|completion| {
            self.write_descriptor(address, characteristic, descriptor, value, completion);
        })
        .await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn set_notify_async(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        enabled: bool,
        on_data_changed: Option<Handler<Vec<u8>>>,
    ) -> Result<bool, BleError> {
        await_completion(|completion| {
            self.set_notify(address, characteristic, enabled, on_data_changed, completion);
        })
        .await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn read_rssi_async(&self, address: &PeripheralAddress) -> Result<i16, BleError> {
        await_completion(|completion| self.read_rssi(address, completion)).await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn request_mtu_async(
        &self,
        address: &PeripheralAddress,
        mtu: u16,
    ) -> Result<u16, BleError> {
        await_completion(|completion| self.request_mtu(address, mtu, completion)).await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn read_phy_async(&self, address: &PeripheralAddress) -> Result<PhyPair, BleError> {
        await_completion(|completion| self.read_phy(address, completion)).await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn set_preferred_phy_async(
        &self,
        address: &PeripheralAddress,
        phy: PhyPair,
    ) -> Result<PhyPair, BleError> {
        await_completion(|completion| self.set_preferred_phy(address, phy, completion)).await
    }

    /// # Errors
    ///
    /// Returns the operation's failure, including watchdog timeouts.
    pub async fn execute_reliable_write_async(
        &self,
        address: &PeripheralAddress,
    ) -> Result<(), BleError> {
        await_completion(|completion| self.execute_reliable_write(address, completion)).await
    }

    /// Routes one platform event. Events for unknown keys are dropped.
    pub fn handle_event(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::Advertisement(_) => {}
            PlatformEvent::ConnectionStateChanged {
                address,
                connected: true,
                ..
            } => self.on_link_established(&address),
            PlatformEvent::ConnectionStateChanged {
                address,
                connected: false,
                status,
            } => self.teardown(&address, Teardown::LinkLost(status)),
            PlatformEvent::ServicesDiscovered { address, result } => {
                if let Ok(services) = &result {
                    self.shared
                        .cache
                        .update(&address, |peripheral| peripheral.set_services(services.clone()));
                }
                let key = operation_key(&address, DiscoverServices::OPERATION, None);
                self.complete::<DiscoverServices>(&address, &key, result);
            }
            PlatformEvent::CharacteristicRead {
                address,
                characteristic,
                result,
            } => {
                let key = operation_key(
                    &address,
                    ReadCharacteristic::OPERATION,
                    Some(&characteristic),
                );
                self.complete::<ReadCharacteristic>(&address, &key, result);
            }
            PlatformEvent::CharacteristicWritten {
                address,
                characteristic,
                result,
            } => {
                let key = operation_key(
                    &address,
                    WriteCharacteristic::OPERATION,
                    Some(&characteristic),
                );
                self.complete::<WriteCharacteristic>(&address, &key, result);
            }
            PlatformEvent::DescriptorRead {
                address,
                characteristic,
                descriptor,
                result,
            } => {
                let key = descriptor_key(
                    &address,
                    ReadDescriptor::OPERATION,
                    &characteristic,
                    &descriptor,
                );
                self.complete::<ReadDescriptor>(&address, &key, result);
            }
            PlatformEvent::DescriptorWritten {
                address,
                characteristic,
                descriptor,
                result,
            } => {
                let key = descriptor_key(
                    &address,
                    WriteDescriptor::OPERATION,
                    &characteristic,
                    &descriptor,
                );
                self.complete::<WriteDescriptor>(&address, &key, result);
            }
            PlatformEvent::NotifyStateChanged {
                address,
                characteristic,
                result,
            } => {
                let key = operation_key(&address, SetNotify::OPERATION, Some(&characteristic));
                self.complete::<SetNotify>(&address, &key, result);
            }
            PlatformEvent::CharacteristicChanged {
                address,
                characteristic,
                value,
            } => {
                if let Some(slot) = self.existing_slot(&address) {
                    let key = operation_key(
                        &address,
                        DATA_CHANGED_OPERATION,
                        Some(&characteristic),
                    );
                    slot.registry.notify_data_changed(&key, value);
                }
            }
            PlatformEvent::RssiRead { address, result } => {
                if let Ok(rssi) = result {
                    self.shared
                        .cache
                        .update(&address, |peripheral| peripheral.set_rssi(rssi));
                }
                let key = operation_key(&address, ReadRssi::OPERATION, None);
                self.complete::<ReadRssi>(&address, &key, result);
            }
            PlatformEvent::MtuChanged { address, result } => {
                if let Ok(mtu) = result {
                    self.shared
                        .cache
                        .update(&address, |peripheral| peripheral.set_mtu(mtu));
                }
                let key = operation_key(&address, RequestMtu::OPERATION, None);
                self.complete::<RequestMtu>(&address, &key, result);
            }
            PlatformEvent::PhyRead { address, result } => {
                let key = operation_key(&address, ReadPhy::OPERATION, None);
                self.complete::<ReadPhy>(&address, &key, result);
            }
            PlatformEvent::PhyUpdated { address, result } => {
                let key = operation_key(&address, SetPreferredPhy::OPERATION, None);
                self.complete::<SetPreferredPhy>(&address, &key, result);
            }
            PlatformEvent::ReliableWriteCompleted { address, result } => {
                let key = operation_key(&address, ExecuteReliableWrite::OPERATION, None);
                self.complete::<ExecuteReliableWrite>(&address, &key, result);
            }
            PlatformEvent::ServiceChanged { address } => {
                if let Some(slot) = self.existing_slot(&address) {
                    slot.registry.notify_service_changed();
                }
            }
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn slot(&self, address: &PeripheralAddress) -> Arc<DeviceSlot> {
        let mut devices = self.shared.devices.lock();
        Arc::clone(devices.entry(address.clone()).or_insert_with(|| {
            Arc::new(DeviceSlot {
                registry: GattCallbackRegistry::new(),
                state: Mutex::new(DeviceState::default()),
            })
        }))
    }

    fn existing_slot(&self, address: &PeripheralAddress) -> Option<Arc<DeviceSlot>> {
        self.shared.devices.lock().get(address).cloned()
    }

    fn set_state(
        &self,
        address: &PeripheralAddress,
        state: &mut DeviceState,
        next: ConnectionState,
    ) {
        state.connection_state = next;
        self.shared
            .cache
            .update(address, |peripheral| peripheral.set_connection_state(next));
    }

    /// Registers a completion, arms its watchdog and issues the command.
    fn issue<F, C, Fut>(
        &self,
        address: &PeripheralAddress,
        key: String,
        completion: Completion<F::Output>,
        command: C,
    ) where
        F: OperationFamily + 'static,
        C: FnOnce(Arc<dyn BlePlatform>, PeripheralAddress) -> Fut,
        Fut: Future<Output = Result<(), BleError>> + Send + 'static,
    {
        let not_connected = || BleError::NotConnected {
            address: address.clone(),
        };
        let Some(slot) = self.existing_slot(address) else {
            completion(Err(not_connected()));
            return;
        };

        {
            let state = slot.state.lock();
            if !state.connection_state.is_connected() {
                drop(state);
                completion(Err(not_connected()));
                return;
            }
            if let Err(completion) = slot.registry.register::<F>(key.clone(), completion) {
                drop(state);
                completion(Err(BleError::OperationInProgress { key }));
                return;
            }

            let timeout = self.shared.config.operation_timeout;
            let weak_slot = Arc::downgrade(&slot);
            let timed_out_key = key.clone();
            self.shared.timers.start_timer(key.clone(), timeout, false, move || {
                if let Some(slot) = weak_slot.upgrade() {
                    warn!(key = %timed_out_key, "gatt operation timed out");
                    slot.registry.notify::<F>(
                        &timed_out_key,
                        Err(BleError::timeout(timed_out_key.clone(), timeout)),
                    );
                }
            });
        }

        trace!(%key, "issuing gatt operation");
        let pending = command(Arc::clone(&self.shared.platform), address.clone());
        let timers = self.shared.timers.clone();
        tokio::spawn(async move {
            if let Err(error) = pending.await {
                timers.cancel_timer(&key);
                slot.registry.notify::<F>(&key, Err(error));
            }
        });
    }

    fn complete<F: OperationFamily>(
        &self,
        address: &PeripheralAddress,
        key: &str,
        result: Result<F::Output, BleError>,
    ) {
        let Some(slot) = self.existing_slot(address) else {
            trace!(key, "result for unknown device");
            return;
        };
        self.shared.timers.cancel_timer(key);
        slot.registry.notify::<F>(key, result);
    }

    fn on_link_established(&self, address: &PeripheralAddress) {
        let Some(slot) = self.existing_slot(address) else {
            debug!(%address, "stale connected event for unknown device");
            self.spawn_disconnect(address);
            return;
        };

        let (attempt, snapshot) = {
            let mut state = slot.state.lock();
            let Some(attempt) = state.pending_connect.take() else {
                let stale = !state.link_open;
                drop(state);
                if stale {
                    debug!(%address, "stale connected event; closing link");
                    self.spawn_disconnect(address);
                } else {
                    trace!(%address, "duplicate connected event");
                }
                return;
            };
            self.shared
                .timers
                .cancel_timer(&operation_key(address, CONNECT_OPERATION, None));
            let next = state.connection_state.on(ConnectionEvent::LinkEstablished);
            state.connection_state = next;
            state.session_disconnected = Some(attempt.on_disconnected);
            let snapshot = self
                .shared
                .cache
                .update(address, |peripheral| peripheral.set_connection_state(next));
            (attempt.on_connected, snapshot)
        };

        info!(%address, "connected");
        attempt(snapshot);
        slot.registry
            .notify_connection_state_changed(ConnectionState::Connected);
    }

    fn on_connect_timeout(&self, address: &PeripheralAddress, timeout: Duration) {
        warn!(%address, ?timeout, "connect timed out");
        let operation = operation_key(address, CONNECT_OPERATION, None);
        self.teardown(
            address,
            Teardown::ConnectTimedOut(BleError::timeout(operation, timeout)),
        );
        self.spawn_disconnect(address);
    }

    fn spawn_disconnect(&self, address: &PeripheralAddress) {
        let platform = Arc::clone(&self.shared.platform);
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(error) = platform.disconnect(&address).await {
                debug!(%address, %error, "best-effort disconnect failed");
            }
        });
    }

    /// Closes the link state for `address` and completes every callback
    /// waiting on it.
    fn teardown(&self, address: &PeripheralAddress, cause: Teardown) {
        let Some(slot) = self.existing_slot(address) else {
            trace!(%address, ?cause, "teardown for unknown device");
            return;
        };

        let (attempt, session, disconnects, requested) = {
            let mut state = slot.state.lock();
            if !state.link_open {
                trace!(%address, ?cause, "teardown without an open link");
                return;
            }
            self.shared
                .timers
                .cancel_timers_with_prefix(&format!("{address}__"));
            state.link_open = false;
            let requested = std::mem::take(&mut state.disconnect_requested);
            let event = if state.pending_connect.is_some() {
                ConnectionEvent::AttemptFailed
            } else {
                ConnectionEvent::LinkLost
            };
            let next = state.connection_state.on(event);
            self.set_state(address, &mut state, next);
            (
                state.pending_connect.take(),
                state.session_disconnected.take(),
                std::mem::take(&mut state.pending_disconnects),
                requested,
            )
        };

        info!(%address, ?cause, "link closed");
        slot.registry.take_all_pending().fail_with(&BleError::NotConnected {
            address: address.clone(),
        });

        let (attempt_error, session_error, disconnect_error) = match cause {
            Teardown::LinkLost(status) => {
                let unexpected = (!requested).then(|| status_error("connect", status));
                let session = (!requested && !status.is_normal_disconnect())
                    .then(|| status_error("connection", status));
                (unexpected, session, None)
            }
            Teardown::ConnectFailed(error) | Teardown::ConnectTimedOut(error) => {
                (Some(error), None, None)
            }
            Teardown::DisconnectFailed(error) => (None, None, Some(error)),
        };

        if let Some(attempt) = attempt {
            let ConnectAttempt {
                on_connected,
                on_disconnected,
            } = attempt;
            drop(on_connected);
            // An attempt that never linked always ends with an error.
            on_disconnected(Some(attempt_error.unwrap_or_else(|| {
                BleError::platform(
                    operation_key(address, CONNECT_OPERATION, None),
                    "cancelled by disconnect",
                )
            })));
        }
        if let Some(session) = session {
            session(session_error);
        }
        for on_disconnected in disconnects {
            on_disconnected(disconnect_error.clone());
        }
        slot.registry
            .notify_connection_state_changed(ConnectionState::Disconnected);
    }
}

fn descriptor_key(
    address: &PeripheralAddress,
    operation: &str,
    characteristic: &str,
    descriptor: &str,
) -> String {
    operation_key(address, operation, Some(&format!("{characteristic}/{descriptor}")))
}

fn status_error(operation: &str, status: GattStatus) -> BleError {
    status.code().map_or_else(
        || BleError::platform(operation, status),
        |code| BleError::platform_status(operation, code),
    )
}

async fn await_completion<T, F>(issue: F) -> Result<T, BleError>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let (tx, rx) = oneshot::channel();
    issue(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await
        .unwrap_or_else(|_| Err(BleError::platform("gatt", "operation dropped without a result")))
}
