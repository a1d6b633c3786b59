use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use super::command::{L2capEchoArgs, OutputFormat};
use crate::central::Central;
use crate::l2cap::L2capCommand;
use crate::model::PeripheralAddress;
use crate::utils::{format_hex, printable_text};

#[derive(Debug, Serialize)]
struct EchoReport<'a> {
    address: &'a PeripheralAddress,
    psm: u16,
    command: String,
    payload_hex: String,
}

/// Executes the `l2cap-echo` command.
#[instrument(skip(central, out), level = "info", fields(address = %args.address, psm = args.psm))]
pub(crate) async fn run<W>(
    central: &Central,
    args: &L2capEchoArgs,
    out: &mut W,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let defaults = central.config().l2cap;
    let address = PeripheralAddress::from(args.address.as_str());
    let command = L2capCommand::echo(args.text.as_bytes())?;

    let mut channel = central.l2cap_channel(address.clone());
    channel
        .connect(args.psm, args.secure, central.config().connect_timeout)
        .await?;
    info!("l2cap channel connected");

    let reply = channel
        .send_command(
            &command,
            defaults.write_timeout,
            defaults.read_timeout,
            args.retries.unwrap_or(defaults.retry_count),
        )
        .await;
    channel.disconnect().await?;
    let reply = reply?;

    match output_format {
        OutputFormat::Pretty => {
            let payload = reply.payload();
            match printable_text(payload) {
                Some(text) => writeln!(out, "{} {text}", reply.id())?,
                None => writeln!(out, "{} {}", reply.id(), format_hex(payload))?,
            }
        }
        OutputFormat::Json => {
            let report = EchoReport {
                address: &address,
                psm: args.psm,
                command: reply.id().to_string(),
                payload_hex: hex::encode(reply.payload()),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
