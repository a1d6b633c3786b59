use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument};

use super::command::{OutputFormat, ScanArgs};
use super::ui::{NearbyView, Painter};
use crate::central::Central;
use crate::model::{Peripheral, PeripheralAddress};
use crate::scanner::{
    InclusionFilter, MinimumRssiFilter, NamePrefixFilter, OutOfRangeFilter, ScanEvent,
    ScanSettings, StaleAdvertisementFilter,
};

#[derive(Debug, Serialize)]
struct NearbyEntry<'a> {
    address: &'a PeripheralAddress,
    name: Option<&'a str>,
    rssi: Option<i16>,
}

/// Executes the `scan` command.
#[instrument(skip(central, out), level = "info", fields(duration = ?args.duration))]
pub(crate) async fn run<W>(
    central: &Central,
    args: &ScanArgs,
    out: &mut W,
    output_format: OutputFormat,
    use_colour: bool,
) -> Result<()>
where
    W: io::Write,
{
    let mut inclusion_filters: Vec<Arc<dyn InclusionFilter>> = Vec::new();
    if let Some(min_rssi) = args.min_rssi {
        inclusion_filters.push(Arc::new(MinimumRssiFilter { min_rssi }));
    }
    if let Some(prefix) = &args.name_prefix {
        inclusion_filters.push(Arc::new(NamePrefixFilter {
            prefix: prefix.clone(),
        }));
    }

    let stale: Arc<dyn OutOfRangeFilter> = Arc::new(StaleAdvertisementFilter {
        max_age: args.duration,
    });

    let (observer, mut events) = mpsc::unbounded_channel();
    let settings = ScanSettings::builder()
        .inclusion_filters(inclusion_filters)
        .out_of_range_filters(vec![stale])
        .observer(Arc::new(observer))
        .build();
    central.scanner().start(settings).await;

    let deadline = Instant::now() + args.duration;
    let mut nearby = Vec::new();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        let event = tokio::select! {
            signal = &mut interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                debug!("scan interrupted");
                break;
            }
            received = timeout_at(deadline, events.recv()) => match received {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            },
        };
        match event {
            ScanEvent::ListChanged(list) => nearby = list,
            ScanEvent::Ended(Some(error)) => return Err(error.into()),
            ScanEvent::Ended(None) => break,
            ScanEvent::Started | ScanEvent::StartDeferred(_) => {
                debug!(?event, "scan progress");
            }
        }
    }
    central.scanner().stop().await;

    write_nearby(out, &nearby, output_format, use_colour)
}

fn write_nearby<W>(
    out: &mut W,
    nearby: &[Arc<Peripheral>],
    output_format: OutputFormat,
    use_colour: bool,
) -> Result<()>
where
    W: io::Write,
{
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", NearbyView::new(nearby, Painter::new(use_colour)))?;
        }
        OutputFormat::Json => {
            let entries: Vec<NearbyEntry<'_>> = nearby
                .iter()
                .map(|peripheral| NearbyEntry {
                    address: peripheral.address(),
                    name: peripheral.name(),
                    rssi: peripheral.rssi(),
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
