mod btleplug_backend;
mod fake_backend;

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;

pub use self::btleplug_backend::BtleplugPlatform;
pub use self::fake_backend::{ConnectBehaviour, FakeDevice, FakePlatform, FakePlatformConfig};
pub(crate) use self::fake_backend::ScanFixture;
use crate::error::BleError;
use crate::model::{
    Advertisement, GattStatus, PeripheralAddress, PhyPair, ServiceInfo, WriteType,
};

/// Byte stream of an open L2CAP channel.
pub trait L2capIo: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> L2capIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

pub type L2capStream = Box<dyn L2capIo>;

/// Results and notifications reported by a platform.
///
/// Every GATT command on [`BlePlatform`] only initiates the operation; its
/// outcome arrives later as one of these events, in platform order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Advertisement(Advertisement),
    ConnectionStateChanged {
        address: PeripheralAddress,
        connected: bool,
        status: GattStatus,
    },
    ServicesDiscovered {
        address: PeripheralAddress,
        result: Result<Vec<ServiceInfo>, BleError>,
    },
    CharacteristicRead {
        address: PeripheralAddress,
        characteristic: String,
        result: Result<Vec<u8>, BleError>,
    },
    CharacteristicWritten {
        address: PeripheralAddress,
        characteristic: String,
        result: Result<(), BleError>,
    },
    DescriptorRead {
        address: PeripheralAddress,
        characteristic: String,
        descriptor: String,
        result: Result<Vec<u8>, BleError>,
    },
    DescriptorWritten {
        address: PeripheralAddress,
        characteristic: String,
        descriptor: String,
        result: Result<(), BleError>,
    },
    NotifyStateChanged {
        address: PeripheralAddress,
        characteristic: String,
        result: Result<bool, BleError>,
    },
    CharacteristicChanged {
        address: PeripheralAddress,
        characteristic: String,
        value: Vec<u8>,
    },
    RssiRead {
        address: PeripheralAddress,
        result: Result<i16, BleError>,
    },
    MtuChanged {
        address: PeripheralAddress,
        result: Result<u16, BleError>,
    },
    PhyRead {
        address: PeripheralAddress,
        result: Result<PhyPair, BleError>,
    },
    PhyUpdated {
        address: PeripheralAddress,
        result: Result<PhyPair, BleError>,
    },
    ReliableWriteCompleted {
        address: PeripheralAddress,
        result: Result<(), BleError>,
    },
    ServiceChanged {
        address: PeripheralAddress,
    },
}

impl PlatformEvent {
    /// Address the event refers to.
    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        match self {
            Self::Advertisement(advertisement) => advertisement.address(),
            Self::ConnectionStateChanged { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicRead { address, .. }
            | Self::CharacteristicWritten { address, .. }
            | Self::DescriptorRead { address, .. }
            | Self::DescriptorWritten { address, .. }
            | Self::NotifyStateChanged { address, .. }
            | Self::CharacteristicChanged { address, .. }
            | Self::RssiRead { address, .. }
            | Self::MtuChanged { address, .. }
            | Self::PhyRead { address, .. }
            | Self::PhyUpdated { address, .. }
            | Self::ReliableWriteCompleted { address, .. }
            | Self::ServiceChanged { address } => address,
        }
    }
}

/// Central-role BLE primitive.
///
/// Implementations report results through the sink handed to [`attach`].
/// A returned `Err` means the command could not be issued at all, and no
/// event will follow for it.
///
/// [`attach`]: BlePlatform::attach
#[async_trait]
pub trait BlePlatform: Send + Sync + Debug {
    /// Installs the event sink. Called once by the owning central.
    fn attach(&self, sink: UnboundedSender<PlatformEvent>);

    /// Whether the platform device registry knows `address`.
    fn is_known_device(&self, address: &PeripheralAddress) -> bool;

    async fn start_scan(&self, service_uuids: &[String]) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    async fn disconnect(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    async fn discover_services(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    async fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
    ) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    async fn read_descriptor(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<(), BleError>;

    async fn write_descriptor(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn set_notify(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        enabled: bool,
    ) -> Result<(), BleError>;

    async fn read_rssi(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    async fn request_mtu(&self, address: &PeripheralAddress, mtu: u16) -> Result<(), BleError>;

    async fn read_phy(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    async fn set_preferred_phy(
        &self,
        address: &PeripheralAddress,
        phy: PhyPair,
    ) -> Result<(), BleError>;

    async fn execute_reliable_write(&self, address: &PeripheralAddress) -> Result<(), BleError>;

    /// Opens an L2CAP channel. Unlike GATT commands this completes inline.
    async fn open_l2cap(
        &self,
        address: &PeripheralAddress,
        psm: u16,
        secure: bool,
    ) -> Result<L2capStream, BleError>;
}
