use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::command::{InspectArgs, OutputFormat};
use super::target::discover;
use super::ui::{Painter, ServicesView};
use crate::central::Central;
use crate::model::{PeripheralAddress, ServiceInfo};

#[derive(Debug, Serialize)]
struct InspectReport<'a> {
    address: &'a PeripheralAddress,
    name: Option<&'a str>,
    rssi: Option<i16>,
    mtu: Option<u16>,
    services: &'a [ServiceInfo],
}

/// Executes the `inspect` command.
#[instrument(skip(central, out), level = "info", fields(address = %args.target.address))]
pub(crate) async fn run<W>(
    central: &Central,
    args: &InspectArgs,
    out: &mut W,
    output_format: OutputFormat,
    use_colour: bool,
) -> Result<()>
where
    W: io::Write,
{
    let address = discover(central, &args.target).await?;
    let connections = central.connections();
    let (_, _link) = connections.connect_async(&address).await?;
    info!("connected");

    let result = async {
        connections.discover_services_async(&address).await?;
        if let Err(error) = connections.read_rssi_async(&address).await {
            warn!(%error, "rssi unavailable");
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Some(peripheral) = connections.peripheral(&address)
        && result.is_ok()
    {
        match output_format {
            OutputFormat::Pretty => {
                writeln!(
                    out,
                    "{}",
                    ServicesView::new(&peripheral, Painter::new(use_colour))
                )?;
            }
            OutputFormat::Json => {
                let report = InspectReport {
                    address: peripheral.address(),
                    name: peripheral.name(),
                    rssi: peripheral.rssi(),
                    mtu: peripheral.mtu(),
                    services: peripheral.services(),
                };
                serde_json::to_writer_pretty(&mut *out, &report)?;
                writeln!(out)?;
            }
        }
    }

    connections.disconnect_async(&address).await?;
    result
}
