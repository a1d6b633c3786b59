use serde::Serialize;
use strum_macros::Display;
use tokio::time::Instant;

use crate::connection::ConnectionState;
use crate::protocol;

/// Platform link-layer address used as the key for every per-device map.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Creates an address from its platform string form.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for PeripheralAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One advertisement observation. A re-observation replaces the snapshot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Advertisement {
    address: PeripheralAddress,
    rssi: i16,
    timestamp: Instant,
    local_name: Option<String>,
    service_uuids: Vec<String>,
    payload: Option<Vec<u8>>,
}

impl Advertisement {
    /// Creates an advertisement observed at `timestamp`.
    #[must_use]
    pub fn new(address: PeripheralAddress, rssi: i16, timestamp: Instant) -> Self {
        Self {
            address,
            rssi,
            timestamp,
            local_name: None,
            service_uuids: Vec::new(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    #[must_use]
    pub fn with_service_uuids(mut self, service_uuids: Vec<String>) -> Self {
        self.service_uuids = service_uuids
            .into_iter()
            .map(|uuid| uuid.to_ascii_lowercase())
            .collect();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Signal strength in dBm.
    #[must_use]
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    #[must_use]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Advertised service UUIDs, lower-cased.
    #[must_use]
    pub fn service_uuids(&self) -> &[String] {
        &self.service_uuids
    }

    /// Raw advertisement bytes, when the platform exposes them.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// A GATT descriptor discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DescriptorInfo {
    uuid: String,
    name: Option<&'static str>,
}

impl DescriptorInfo {
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        let uuid = uuid.into().to_ascii_lowercase();
        let name = protocol::name_for_uuid(&uuid);
        Self { uuid, name }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    uuid: String,
    name: Option<&'static str>,
    properties: Vec<String>,
    descriptors: Vec<DescriptorInfo>,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn new(uuid: impl Into<String>, properties: Vec<String>) -> Self {
        let uuid = uuid.into().to_ascii_lowercase();
        let name = protocol::name_for_uuid(&uuid);
        Self {
            uuid,
            name,
            properties,
            descriptors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_descriptors(mut self, descriptors: Vec<DescriptorInfo>) -> Self {
        self.descriptors = descriptors;
        self
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Property labels such as `read`, `write` or `notify`.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    #[must_use]
    pub fn descriptors(&self) -> &[DescriptorInfo] {
        &self.descriptors
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: String,
    name: Option<&'static str>,
    primary: bool,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        primary: bool,
        characteristics: Vec<CharacteristicInfo>,
    ) -> Self {
        let uuid = uuid.into().to_ascii_lowercase();
        let name = protocol::name_for_uuid(&uuid);
        Self {
            uuid,
            name,
            primary,
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }

    /// Finds a characteristic in this service by UUID, ignoring case.
    #[must_use]
    pub fn characteristic(&self, uuid: &str) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
    }
}

/// Canonical per-address record held by the peripheral cache.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peripheral {
    address: PeripheralAddress,
    advertisement: Option<Advertisement>,
    connection_state: ConnectionState,
    mtu: Option<u16>,
    services: Vec<ServiceInfo>,
    rssi: Option<i16>,
}

impl Peripheral {
    /// Creates an empty record for an address that has not been observed yet.
    #[must_use]
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            advertisement: None,
            connection_state: ConnectionState::Undetermined,
            mtu: None,
            services: Vec::new(),
            rssi: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Latest advertisement snapshot, if the device was seen in a scan.
    #[must_use]
    pub fn advertisement(&self) -> Option<&Advertisement> {
        self.advertisement.as_ref()
    }

    /// Advertised local name from the latest advertisement.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.advertisement
            .as_ref()
            .and_then(Advertisement::local_name)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Negotiated ATT MTU.
    #[must_use]
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    /// Latest RSSI from either an advertisement or an explicit RSSI read.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Time since the latest advertisement, measured from `now`.
    #[must_use]
    pub fn time_since_last_seen(&self, now: Instant) -> Option<std::time::Duration> {
        self.advertisement
            .as_ref()
            .map(|advertisement| now.saturating_duration_since(advertisement.timestamp()))
    }

    /// Finds a characteristic in any discovered service.
    #[must_use]
    pub fn characteristic(&self, uuid: &str) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .find_map(|service| service.characteristic(uuid))
    }

    pub(crate) fn observe(&mut self, advertisement: Advertisement) {
        self.rssi = Some(advertisement.rssi());
        self.advertisement = Some(advertisement);
    }

    pub(crate) fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub(crate) fn set_mtu(&mut self, mtu: u16) {
        self.mtu = Some(mtu);
    }

    pub(crate) fn set_services(&mut self, services: Vec<ServiceInfo>) {
        self.services = services;
    }

    pub(crate) fn set_rssi(&mut self, rssi: i16) {
        self.rssi = Some(rssi);
    }
}

/// Characteristic write mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum WriteType {
    #[strum(to_string = "with_response")]
    WithResponse,
    #[strum(to_string = "without_response")]
    WithoutResponse,
}

/// LE physical layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum Phy {
    #[strum(to_string = "le_1m")]
    Le1M,
    #[strum(to_string = "le_2m")]
    Le2M,
    #[strum(to_string = "le_coded")]
    LeCoded,
}

impl Phy {
    /// Maps a platform PHY constant, falling back to LE 1M for unknown values.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::Le2M,
            3 => Self::LeCoded,
            _ => Self::Le1M,
        }
    }
}

/// Transmit and receive PHY of a link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct PhyPair {
    pub tx: Phy,
    pub rx: Phy,
}

/// Status attached to a platform connection-state change.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum GattStatus {
    #[display("success")]
    Success,
    #[display("connection_timeout")]
    ConnectionTimeout,
    #[display("peer_terminated")]
    PeerTerminated,
    #[display("local_terminated")]
    LocalTerminated,
    #[display("gatt_error")]
    GattError,
    /// The platform did not report a reason.
    #[display("unspecified")]
    Unspecified,
    #[display("other({_0})")]
    Other(i32),
}

impl GattStatus {
    /// Maps a platform HCI/GATT status code. Unknown codes are preserved.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            8 => Self::ConnectionTimeout,
            19 => Self::PeerTerminated,
            22 => Self::LocalTerminated,
            133 => Self::GattError,
            other => Self::Other(other),
        }
    }

    /// Returns the numeric platform code, if the status has one.
    #[must_use]
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::ConnectionTimeout => Some(8),
            Self::PeerTerminated => Some(19),
            Self::LocalTerminated => Some(22),
            Self::GattError => Some(133),
            Self::Unspecified => None,
            Self::Other(code) => Some(code),
        }
    }

    /// Whether a link closing with this status counts as a normal drop.
    #[must_use]
    pub fn is_normal_disconnect(self) -> bool {
        matches!(self, Self::Success | Self::LocalTerminated)
    }
}
