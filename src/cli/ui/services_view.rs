use std::fmt::{self, Display, Formatter};

use super::painter::Painter;
use super::table::Table;
use crate::model::{CharacteristicInfo, Peripheral};

/// Connected peripheral summary followed by one table per GATT service.
pub(crate) struct ServicesView<'a> {
    peripheral: &'a Peripheral,
    painter: Painter,
}

impl<'a> ServicesView<'a> {
    pub(crate) fn new(peripheral: &'a Peripheral, painter: Painter) -> Self {
        Self {
            peripheral,
            painter,
        }
    }
}

impl Display for ServicesView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        let peripheral = self.peripheral;
        writeln!(
            f,
            "{} {}",
            painter.heading(peripheral.address().as_str()),
            peripheral.name().unwrap_or_default()
        )?;
        writeln!(
            f,
            "{} {}  {} {}  {} {}",
            painter.muted("state"),
            painter.state(peripheral.connection_state()),
            painter.muted("rssi"),
            painter.rssi(peripheral.rssi()),
            painter.muted("mtu"),
            peripheral
                .mtu()
                .map_or_else(|| "-".to_string(), |mtu| mtu.to_string()),
        )?;

        for service in peripheral.services() {
            writeln!(f)?;
            writeln!(
                f,
                "{} {}{}",
                painter.heading(service.name().unwrap_or("Service")),
                painter.muted(service.uuid()),
                if service.is_primary() { "" } else { " (secondary)" },
            )?;
            let mut table = Table::new(["characteristic", "name", "properties", "descriptors"]);
            for characteristic in service.characteristics() {
                table.push(characteristic_row(characteristic, painter));
            }
            if table.is_empty() {
                writeln!(f, "{}", painter.muted("no characteristics"))?;
            } else {
                writeln!(f, "{table}")?;
            }
        }
        Ok(())
    }
}

fn characteristic_row(characteristic: &CharacteristicInfo, painter: Painter) -> Vec<String> {
    let descriptors = characteristic
        .descriptors()
        .iter()
        .map(|descriptor| descriptor.name().unwrap_or(descriptor.uuid()))
        .collect::<Vec<_>>()
        .join(", ");
    vec![
        painter.value(characteristic.uuid()),
        characteristic.name().unwrap_or("-").to_string(),
        characteristic.properties().join(", "),
        descriptors,
    ]
}
