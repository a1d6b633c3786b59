use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::instrument;

use super::command::{OutputFormat, ReadArgs};
use super::target::discover;
use crate::central::Central;
use crate::model::PeripheralAddress;
use crate::protocol;
use crate::utils::{format_hex, printable_text};

#[derive(Debug, Serialize)]
struct ReadReport<'a> {
    address: &'a PeripheralAddress,
    characteristic: &'a str,
    name: Option<&'static str>,
    value_hex: String,
}

/// Executes the `read` command.
#[instrument(
    skip(central, out),
    level = "info",
    fields(address = %args.target.address, characteristic = %args.characteristic)
)]
pub(crate) async fn run<W>(
    central: &Central,
    args: &ReadArgs,
    out: &mut W,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let characteristic = protocol::resolve_uuid(&args.characteristic);
    let address = discover(central, &args.target).await?;
    let connections = central.connections();
    let (_, _link) = connections.connect_async(&address).await?;

    let result = async {
        connections.discover_services_async(&address).await?;
        Ok::<_, anyhow::Error>(
            connections
                .read_characteristic_async(&address, &characteristic)
                .await?,
        )
    }
    .await;
    connections.disconnect_async(&address).await?;
    let value = result?;

    let name = protocol::name_for_uuid(&characteristic);
    match output_format {
        OutputFormat::Pretty => {
            writeln!(
                out,
                "{} {}",
                name.unwrap_or(characteristic.as_str()),
                format_hex(&value)
            )?;
            if let Some(text) = printable_text(&value) {
                writeln!(out, "text {text:?}")?;
            }
        }
        OutputFormat::Json => {
            let report = ReadReport {
                address: &address,
                characteristic: &characteristic,
                name,
                value_hex: hex::encode(&value),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
