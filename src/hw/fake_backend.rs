use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use super::{BlePlatform, L2capStream, PlatformEvent};
use crate::error::{BleError, FixtureError};
use crate::l2cap::{EchoCommandHandler, L2capCommandServer};
use crate::model::{
    Advertisement, CharacteristicInfo, DescriptorInfo, GattStatus, Phy, PhyPair,
    PeripheralAddress, ServiceInfo, WriteType,
};
use crate::protocol::{self, KnownAttribute};

const DEFAULT_MTU_LIMIT: u16 = 247;
const L2CAP_BUFFER_SIZE: usize = 64 * 1024;
const BATTERY_LEVEL: u8 = 87;

/// A fixture peripheral the fake platform advertises and accepts links to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeDevice {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub payload: Option<Vec<u8>>,
}

impl FakeDevice {
    #[must_use]
    pub fn new(address: impl Into<PeripheralAddress>, name: Option<&str>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            rssi,
            payload: None,
        }
    }

    fn advertisement(&self, now: Instant) -> Advertisement {
        let mut advertisement = Advertisement::new(self.address.clone(), self.rssi, now)
            .with_service_uuids(vec![protocol::known_uuid(KnownAttribute::BatteryService)]);
        if let Some(name) = &self.name {
            advertisement = advertisement.with_local_name(name);
        }
        if let Some(payload) = &self.payload {
            advertisement = advertisement.with_payload(payload.clone());
        }
        advertisement
    }
}

/// Parsed `address|name|rssi[|payload-hex];...` fixture.
#[derive(Debug, Clone, derive_more::Into)]
pub(crate) struct ScanFixture {
    devices: Vec<FakeDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        let devices = value
            .split(';')
            .filter(|record| !record.trim().is_empty())
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }
}

fn parse_scan_record(raw_record: &str) -> Result<FakeDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields[0].is_empty() {
        return Err(FixtureError::EmptyAddress);
    }

    let name = match fields[1] {
        "" | "-" => None,
        name => Some(name),
    };
    let rssi = fields[2].parse::<i16>()?;
    let mut device = FakeDevice::new(fields[0], name, rssi);
    if let Some(payload) = fields.get(3) {
        device.payload = Some(hex::decode(payload)?);
    }
    Ok(device)
}

/// How the fake platform answers a connect command.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ConnectBehaviour {
    #[default]
    Succeed,
    /// Accept the command and never report a state change.
    NeverRespond,
    /// Report a disconnected state change carrying `status`.
    Fail { status: GattStatus },
}

/// Settings for constructing a fake platform.
#[derive(Debug, Clone, Builder)]
pub struct FakePlatformConfig {
    #[builder(default)]
    devices: Vec<FakeDevice>,
    #[builder(default)]
    connect_behaviour: ConnectBehaviour,
    /// Whether disconnect commands are answered.
    #[builder(default = true)]
    answer_disconnects: bool,
    #[builder(default = default_services())]
    services: Vec<ServiceInfo>,
    /// Initial attribute values keyed by lower-case characteristic UUID, or
    /// `characteristic/descriptor` for descriptors.
    #[builder(default = default_values())]
    values: HashMap<String, Vec<u8>>,
    /// Characteristics whose commands are accepted but never answered.
    #[builder(default)]
    unresponsive: HashSet<String>,
    #[builder(default)]
    response_delay: Duration,
    #[builder(default = DEFAULT_MTU_LIMIT)]
    mtu_limit: u16,
    /// Advertise every fixture device as soon as a scan starts.
    #[builder(default = true)]
    advertise_on_scan: bool,
    #[builder(default = true)]
    l2cap_enabled: bool,
}

impl Default for FakePlatformConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Link {
    Connecting,
    Connected,
}

/// In-process platform used by tests and by the CLI without hardware.
#[derive(Debug)]
pub struct FakePlatform {
    config: FakePlatformConfig,
    sink: Mutex<Option<UnboundedSender<PlatformEvent>>>,
    connect_behaviour: Mutex<ConnectBehaviour>,
    links: Mutex<HashMap<PeripheralAddress, Link>>,
    values: Mutex<HashMap<String, Vec<u8>>>,
    phys: Mutex<HashMap<PeripheralAddress, PhyPair>>,
    scanning: Mutex<bool>,
    scan_starts: AtomicUsize,
    connect_commands: AtomicUsize,
    disconnect_commands: AtomicUsize,
}

impl FakePlatform {
    #[must_use]
    pub fn new(config: FakePlatformConfig) -> Self {
        let values = config
            .values
            .iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value.clone()))
            .collect();
        Self {
            connect_behaviour: Mutex::new(config.connect_behaviour),
            config,
            sink: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            values: Mutex::new(values),
            phys: Mutex::new(HashMap::new()),
            scanning: Mutex::new(false),
            scan_starts: AtomicUsize::new(0),
            connect_commands: AtomicUsize::new(0),
            disconnect_commands: AtomicUsize::new(0),
        }
    }

    /// Changes how later connect commands are answered.
    pub fn set_connect_behaviour(&self, behaviour: ConnectBehaviour) {
        *self.connect_behaviour.lock() = behaviour;
    }

    /// Number of platform scan starts issued so far.
    #[must_use]
    pub fn scan_start_count(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// Number of connect commands issued so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connect_commands.load(Ordering::SeqCst)
    }

    /// Number of disconnect commands issued so far, answered or not.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnect_commands.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        *self.scanning.lock()
    }

    #[must_use]
    pub fn is_linked(&self, address: &PeripheralAddress) -> bool {
        self.links.lock().get(address) == Some(&Link::Connected)
    }

    /// Emits an arbitrary event immediately.
    pub fn emit(&self, event: PlatformEvent) {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                if sink.send(event).is_err() {
                    trace!("fake platform sink closed");
                }
            }
            None => trace!("fake platform has no sink attached"),
        }
    }

    /// Advertises a fixture device with an explicit RSSI.
    pub fn advertise(&self, address: &PeripheralAddress, rssi: i16) {
        let now = Instant::now();
        let advertisement = self
            .device(address)
            .map_or_else(
                || Advertisement::new(address.clone(), rssi, now),
                |device| FakeDevice { rssi, ..device.clone() }.advertisement(now),
            );
        self.emit(PlatformEvent::Advertisement(advertisement));
    }

    /// Drops an open link or pending attempt as if the peer went away.
    pub fn drop_link(&self, address: &PeripheralAddress, status: GattStatus) {
        if self.links.lock().remove(address).is_some() {
            self.emit(PlatformEvent::ConnectionStateChanged {
                address: address.clone(),
                connected: false,
                status,
            });
        }
    }

    /// Emits a characteristic value notification.
    pub fn notify_value(&self, address: &PeripheralAddress, characteristic: &str, value: Vec<u8>) {
        self.emit(PlatformEvent::CharacteristicChanged {
            address: address.clone(),
            characteristic: characteristic.to_ascii_lowercase(),
            value,
        });
    }

    fn device(&self, address: &PeripheralAddress) -> Option<&FakeDevice> {
        self.config
            .devices
            .iter()
            .find(|device| &device.address == address)
    }

    /// Emits `event` after the configured response delay.
    fn respond(&self, event: PlatformEvent) {
        let delay = self.config.response_delay;
        if delay.is_zero() {
            self.emit(event);
            return;
        }
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = sink.send(event);
        });
    }

    fn require_link(&self, address: &PeripheralAddress, operation: &str) -> Result<(), BleError> {
        if self.is_linked(address) {
            Ok(())
        } else {
            Err(BleError::platform(operation, "no open link"))
        }
    }

    fn answers(&self, characteristic: &str) -> bool {
        let answers = !self
            .config
            .unresponsive
            .iter()
            .any(|uuid| uuid.eq_ignore_ascii_case(characteristic));
        if !answers {
            debug!(characteristic, "fake platform leaving command unanswered");
        }
        answers
    }

    fn stored_value(&self, key: &str, operation: &str) -> Result<Vec<u8>, BleError> {
        self.values
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BleError::platform_status(operation, ATTRIBUTE_NOT_FOUND))
    }
}

const ATTRIBUTE_NOT_FOUND: i32 = 0x0a;

#[async_trait]
impl BlePlatform for FakePlatform {
    fn attach(&self, sink: UnboundedSender<PlatformEvent>) {
        *self.sink.lock() = Some(sink);
    }

    fn is_known_device(&self, address: &PeripheralAddress) -> bool {
        self.device(address).is_some()
    }

    async fn start_scan(&self, _service_uuids: &[String]) -> Result<(), BleError> {
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        *self.scanning.lock() = true;
        if self.config.advertise_on_scan {
            let now = Instant::now();
            for device in &self.config.devices {
                self.respond(PlatformEvent::Advertisement(device.advertisement(now)));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        *self.scanning.lock() = false;
        Ok(())
    }

    async fn connect(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.connect_commands.fetch_add(1, Ordering::SeqCst);
        let behaviour = *self.connect_behaviour.lock();
        match behaviour {
            ConnectBehaviour::Succeed => {
                self.links.lock().insert(address.clone(), Link::Connected);
                self.respond(PlatformEvent::ConnectionStateChanged {
                    address: address.clone(),
                    connected: true,
                    status: GattStatus::Success,
                });
            }
            ConnectBehaviour::NeverRespond => {
                self.links.lock().insert(address.clone(), Link::Connecting);
            }
            ConnectBehaviour::Fail { status } => {
                self.respond(PlatformEvent::ConnectionStateChanged {
                    address: address.clone(),
                    connected: false,
                    status,
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.disconnect_commands.fetch_add(1, Ordering::SeqCst);
        if !self.config.answer_disconnects {
            return Ok(());
        }
        if self.links.lock().remove(address).is_some() {
            self.respond(PlatformEvent::ConnectionStateChanged {
                address: address.clone(),
                connected: false,
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    async fn discover_services(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.require_link(address, "discover_services")?;
        self.respond(PlatformEvent::ServicesDiscovered {
            address: address.clone(),
            result: Ok(self.config.services.clone()),
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
    ) -> Result<(), BleError> {
        self.require_link(address, "read_characteristic")?;
        if !self.answers(characteristic) {
            return Ok(());
        }
        let characteristic = characteristic.to_ascii_lowercase();
        let result = self.stored_value(&characteristic, "read_characteristic");
        self.respond(PlatformEvent::CharacteristicRead {
            address: address.clone(),
            characteristic,
            result,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<(), BleError> {
        self.require_link(address, "write_characteristic")?;
        if !self.answers(characteristic) {
            return Ok(());
        }
        let characteristic = characteristic.to_ascii_lowercase();
        self.values
            .lock()
            .insert(characteristic.clone(), value.to_vec());
        self.respond(PlatformEvent::CharacteristicWritten {
            address: address.clone(),
            characteristic,
            result: Ok(()),
        });
        Ok(())
    }

    async fn read_descriptor(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<(), BleError> {
        self.require_link(address, "read_descriptor")?;
        if !self.answers(characteristic) {
            return Ok(());
        }
        let characteristic = characteristic.to_ascii_lowercase();
        let descriptor = descriptor.to_ascii_lowercase();
        let result =
            self.stored_value(&format!("{characteristic}/{descriptor}"), "read_descriptor");
        self.respond(PlatformEvent::DescriptorRead {
            address: address.clone(),
            characteristic,
            descriptor,
            result,
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
        self.require_link(address, "write_descriptor")?;
        if !self.answers(characteristic) {
            return Ok(());
        }
        let characteristic = characteristic.to_ascii_lowercase();
        let descriptor = descriptor.to_ascii_lowercase();
        self.values
            .lock()
            .insert(format!("{characteristic}/{descriptor}"), value.to_vec());
        self.respond(PlatformEvent::DescriptorWritten {
            address: address.clone(),
            characteristic,
            descriptor,
            result: Ok(()),
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        address: &PeripheralAddress,
        characteristic: &str,
        enabled: bool,
    ) -> Result<(), BleError> {
        self.require_link(address, "set_notify")?;
        if !self.answers(characteristic) {
            return Ok(());
        }
        self.respond(PlatformEvent::NotifyStateChanged {
            address: address.clone(),
            characteristic: characteristic.to_ascii_lowercase(),
            result: Ok(enabled),
        });
        Ok(())
    }

    async fn read_rssi(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.require_link(address, "read_rssi")?;
        let result = self
            .device(address)
            .map(|device| device.rssi)
            .ok_or_else(|| BleError::platform("read_rssi", "unknown device"));
        self.respond(PlatformEvent::RssiRead {
            address: address.clone(),
            result,
        });
        Ok(())
    }

    async fn request_mtu(&self, address: &PeripheralAddress, mtu: u16) -> Result<(), BleError> {
        self.require_link(address, "request_mtu")?;
        self.respond(PlatformEvent::MtuChanged {
            address: address.clone(),
            result: Ok(mtu.min(self.config.mtu_limit)),
        });
        Ok(())
    }

    async fn read_phy(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.require_link(address, "read_phy")?;
        let phy = self
            .phys
            .lock()
            .get(address)
            .copied()
            .unwrap_or(PhyPair {
                tx: Phy::Le1M,
                rx: Phy::Le1M,
            });
        self.respond(PlatformEvent::PhyRead {
            address: address.clone(),
            result: Ok(phy),
        });
        Ok(())
    }

    async fn set_preferred_phy(
        &self,
        address: &PeripheralAddress,
        phy: PhyPair,
    ) -> Result<(), BleError> {
        self.require_link(address, "set_preferred_phy")?;
        self.phys.lock().insert(address.clone(), phy);
        self.respond(PlatformEvent::PhyUpdated {
            address: address.clone(),
            result: Ok(phy),
        });
        Ok(())
    }

    async fn execute_reliable_write(&self, address: &PeripheralAddress) -> Result<(), BleError> {
        self.require_link(address, "execute_reliable_write")?;
        self.respond(PlatformEvent::ReliableWriteCompleted {
            address: address.clone(),
            result: Ok(()),
        });
        Ok(())
    }

    async fn open_l2cap(
        &self,
        address: &PeripheralAddress,
        psm: u16,
        secure: bool,
    ) -> Result<L2capStream, BleError> {
        if !self.config.l2cap_enabled {
            return Err(BleError::platform("open_l2cap", "L2CAP is disabled"));
        }
        if self.device(address).is_none() {
            return Err(BleError::PreconditionFailed {
                address: address.clone(),
            });
        }
        debug!(%address, psm, secure, "opening fake L2CAP channel");
        let (local, remote) = tokio::io::duplex(L2CAP_BUFFER_SIZE);
        tokio::spawn(async move {
            let server = L2capCommandServer::new(EchoCommandHandler);
            if let Err(error) = server.serve(remote).await {
                debug!(%error, "fake L2CAP peer stopped");
            }
        });
        Ok(Box::new(local))
    }
}

fn default_services() -> Vec<ServiceInfo> {
    let battery_level = protocol::known_uuid(KnownAttribute::BatteryLevel);
    let device_name = protocol::known_uuid(KnownAttribute::DeviceName);
    vec![
        ServiceInfo::new(
            protocol::known_uuid(KnownAttribute::GenericAccess),
            true,
            vec![CharacteristicInfo::new(device_name, vec!["read".to_string()])],
        ),
        ServiceInfo::new(
            protocol::known_uuid(KnownAttribute::BatteryService),
            true,
            vec![
                CharacteristicInfo::new(
                    battery_level,
                    vec!["read".to_string(), "notify".to_string()],
                )
                .with_descriptors(vec![DescriptorInfo::new(protocol::known_uuid(
                    KnownAttribute::ClientCharacteristicConfiguration,
                ))]),
            ],
        ),
    ]
}

fn default_values() -> HashMap<String, Vec<u8>> {
    let battery_level = protocol::known_uuid(KnownAttribute::BatteryLevel);
    let cccd = protocol::known_uuid(KnownAttribute::ClientCharacteristicConfiguration);
    HashMap::from([
        (battery_level.clone(), vec![BATTERY_LEVEL]),
        (
            protocol::known_uuid(KnownAttribute::DeviceName),
            b"UU Fake".to_vec(),
        ),
        (format!("{battery_level}/{cccd}"), vec![0x00, 0x00]),
    ])
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB|UU-Beacon|-43", 1)]
    #[case("AA:BB|UU-Beacon|-43;CC:DD|-|-55", 2)]
    #[case("AA:BB|UU-Beacon|-43|0201ff;", 1)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let fixture: ScanFixture = fixture.parse().expect("fixture should parse");
        let devices: Vec<FakeDevice> = fixture.into();
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn scan_fixture_keeps_fields() {
        let fixture: ScanFixture = "AA:BB|-|-60|0201ff".parse().expect("fixture should parse");
        let devices: Vec<FakeDevice> = fixture.into();
        assert_eq!(
            vec![FakeDevice {
                address: PeripheralAddress::from("AA:BB"),
                name: None,
                rssi: -60,
                payload: Some(vec![0x02, 0x01, 0xff]),
            }],
            devices
        );
    }

    #[rstest]
    #[case("", "empty")]
    #[case("AA:BB|UU-Beacon", "count")]
    #[case("|UU-Beacon|-43", "address")]
    #[case("AA:BB|UU-Beacon|loud", "rssi")]
    #[case("AA:BB|UU-Beacon|-43|zz", "hex")]
    fn scan_fixture_rejects_invalid_records(#[case] fixture: &str, #[case] kind: &str) {
        let result = fixture.parse::<ScanFixture>();
        match kind {
            "empty" => assert_matches!(result, Err(FixtureError::EmptyFixture)),
            "count" => assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount)),
            "address" => assert_matches!(result, Err(FixtureError::EmptyAddress)),
            "rssi" => assert_matches!(result, Err(FixtureError::InvalidRssi(_))),
            _ => assert_matches!(result, Err(FixtureError::InvalidHex(_))),
        }
    }

    #[tokio::test]
    async fn gatt_commands_need_a_link() {
        let platform = FakePlatform::new(
            FakePlatformConfig::builder()
                .devices(vec![FakeDevice::new("AA:BB", Some("Cube"), -40)])
                .build(),
        );
        let address = PeripheralAddress::from("AA:BB");

        let result = platform.read_rssi(&address).await;

        assert_matches!(result, Err(BleError::PlatformOperationFailed { .. }));
    }

    #[tokio::test]
    async fn connect_then_read_reports_events_in_order() -> anyhow::Result<()> {
        let platform = FakePlatform::new(
            FakePlatformConfig::builder()
                .devices(vec![FakeDevice::new("AA:BB", Some("Cube"), -40)])
                .build(),
        );
        let (sink, mut events) = tokio::sync::mpsc::unbounded_channel();
        platform.attach(sink);
        let address = PeripheralAddress::from("AA:BB");
        let battery_level = protocol::known_uuid(KnownAttribute::BatteryLevel);

        platform.connect(&address).await?;
        platform.read_characteristic(&address, &battery_level).await?;

        assert_matches!(
            events.recv().await,
            Some(PlatformEvent::ConnectionStateChanged { connected: true, .. })
        );
        assert_eq!(
            Some(PlatformEvent::CharacteristicRead {
                address,
                characteristic: battery_level,
                result: Ok(vec![BATTERY_LEVEL]),
            }),
            events.recv().await
        );
        Ok(())
    }
}
