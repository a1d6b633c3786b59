use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// Bluetooth SIG base UUID suffix for 16-bit assigned numbers.
const SIG_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Well-known GATT attributes that get a human-readable name.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, EnumString, Display)]
pub enum KnownAttribute {
    #[strum(to_string = "generic_access")]
    GenericAccess,
    #[strum(to_string = "generic_attribute")]
    GenericAttribute,
    #[strum(to_string = "device_information")]
    DeviceInformation,
    #[strum(to_string = "battery_service")]
    BatteryService,
    #[strum(to_string = "heart_rate")]
    HeartRate,
    #[strum(to_string = "device_name")]
    DeviceName,
    #[strum(to_string = "appearance")]
    Appearance,
    #[strum(to_string = "service_changed")]
    ServiceChanged,
    #[strum(to_string = "battery_level")]
    BatteryLevel,
    #[strum(to_string = "manufacturer_name")]
    ManufacturerName,
    #[strum(to_string = "model_number")]
    ModelNumber,
    #[strum(to_string = "firmware_revision")]
    FirmwareRevision,
    #[strum(to_string = "heart_rate_measurement")]
    HeartRateMeasurement,
    #[strum(to_string = "client_characteristic_configuration")]
    ClientCharacteristicConfiguration,
    #[strum(to_string = "characteristic_user_description")]
    CharacteristicUserDescription,
}

/// Descriptive metadata for one well-known attribute.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct AttributeMetadata {
    name: &'static str,
    short_uuid: u16,
}

impl AttributeMetadata {
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    /// Full 128-bit UUID string, lower-cased.
    pub(crate) fn uuid(self) -> String {
        expand_short_uuid(self.short_uuid)
    }
}

/// Attribute metadata keyed by full lower-case UUID.
static ATTRIBUTES_BY_UUID: LazyLock<HashMap<String, AttributeMetadata>> = LazyLock::new(|| {
    KnownAttribute::iter()
        .map(metadata_for)
        .map(|metadata| (metadata.uuid(), metadata))
        .collect()
});

/// Returns the human-readable name of a well-known attribute UUID.
pub(crate) fn name_for_uuid(uuid: &str) -> Option<&'static str> {
    ATTRIBUTES_BY_UUID
        .get(&uuid.to_ascii_lowercase())
        .map(|metadata| metadata.name())
}

/// Returns the full UUID of a well-known attribute.
#[must_use]
pub fn known_uuid(attribute: KnownAttribute) -> String {
    metadata_for(attribute).uuid()
}

/// Expands a 16-bit SIG assigned number into a full UUID string.
#[must_use]
pub fn expand_short_uuid(short_uuid: u16) -> String {
    format!("0000{short_uuid:04x}{SIG_BASE_SUFFIX}")
}

/// Resolves user input to a full lower-case UUID.
///
/// Accepts a known attribute name (`battery_level`), a 16-bit assigned number
/// with or without a `0x` prefix, or a full UUID.
#[must_use]
pub fn resolve_uuid(input: &str) -> String {
    let input = input.trim();
    if let Ok(attribute) = input.parse::<KnownAttribute>() {
        return known_uuid(attribute);
    }
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if digits.len() == 4
        && let Ok(short_uuid) = u16::from_str_radix(digits, 16)
    {
        return expand_short_uuid(short_uuid);
    }
    input.to_ascii_lowercase()
}

fn metadata_for(attribute: KnownAttribute) -> AttributeMetadata {
    let (name, short_uuid) = match attribute {
        KnownAttribute::GenericAccess => ("Generic Access", 0x1800),
        KnownAttribute::GenericAttribute => ("Generic Attribute", 0x1801),
        KnownAttribute::DeviceInformation => ("Device Information", 0x180A),
        KnownAttribute::BatteryService => ("Battery Service", 0x180F),
        KnownAttribute::HeartRate => ("Heart Rate", 0x180D),
        KnownAttribute::DeviceName => ("Device Name", 0x2A00),
        KnownAttribute::Appearance => ("Appearance", 0x2A01),
        KnownAttribute::ServiceChanged => ("Service Changed", 0x2A05),
        KnownAttribute::BatteryLevel => ("Battery Level", 0x2A19),
        KnownAttribute::ManufacturerName => ("Manufacturer Name String", 0x2A29),
        KnownAttribute::ModelNumber => ("Model Number String", 0x2A24),
        KnownAttribute::FirmwareRevision => ("Firmware Revision String", 0x2A26),
        KnownAttribute::HeartRateMeasurement => ("Heart Rate Measurement", 0x2A37),
        KnownAttribute::ClientCharacteristicConfiguration => {
            ("Client Characteristic Configuration", 0x2902)
        }
        KnownAttribute::CharacteristicUserDescription => {
            ("Characteristic User Description", 0x2901)
        }
    };
    AttributeMetadata { name, short_uuid }
}
