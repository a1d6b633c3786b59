use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use super::painter::Painter;
use super::table::Table;
use crate::model::Peripheral;

/// Nearby peripherals as a table, in the order given.
pub(crate) struct NearbyView<'a> {
    nearby: &'a [Arc<Peripheral>],
    painter: Painter,
}

impl<'a> NearbyView<'a> {
    pub(crate) fn new(nearby: &'a [Arc<Peripheral>], painter: Painter) -> Self {
        Self { nearby, painter }
    }
}

impl Display for NearbyView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        if self.nearby.is_empty() {
            return write!(f, "{}", painter.muted("No peripherals found."));
        }

        writeln!(
            f,
            "{}",
            painter.heading(&format!("{} nearby", self.nearby.len()))
        )?;
        let mut table = Table::new(["address", "name", "rssi"]);
        for peripheral in self.nearby {
            table.push(vec![
                painter.value(peripheral.address().as_str()),
                peripheral
                    .name()
                    .map_or_else(|| painter.muted("<unnamed>"), ToString::to_string),
                painter.rssi(peripheral.rssi()),
            ]);
        }
        write!(f, "{table}")
    }
}
