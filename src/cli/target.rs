use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{Span, debug, info, instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::command::TargetArgs;
use crate::central::Central;
use crate::model::{Peripheral, PeripheralAddress};
use crate::scanner::{ScanEvent, ScanSettings};

/// Scans until `target` is advertising, then stops the scan.
///
/// The platform only connects to devices it has seen, so every command that
/// talks to a single peripheral discovers it first.
#[instrument(skip(central), level = "info", fields(address = %target.address))]
pub(crate) async fn discover(central: &Central, target: &TargetArgs) -> Result<PeripheralAddress> {
    let address = PeripheralAddress::from(target.address.as_str());
    if central.cache().get(&address).is_some() {
        return Ok(address);
    }

    Span::current().pb_set_message(&format!("Scanning for {address}"));
    let (observer, mut events) = mpsc::unbounded_channel();
    let settings = ScanSettings::builder()
        .observer(Arc::new(observer))
        .build();
    central.scanner().start(settings).await;

    let deadline = Instant::now() + target.discovery_timeout;
    let found = loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(ScanEvent::ListChanged(nearby))) if contains(&nearby, &address) => {
                break Ok(());
            }
            Ok(Some(ScanEvent::Ended(Some(error)))) => break Err(anyhow!(error)),
            Ok(Some(event)) => debug!(?event, "waiting for target"),
            Ok(None) | Err(_) => {
                break Err(anyhow!(
                    "`{address}` was not seen within {}",
                    humantime::format_duration(target.discovery_timeout)
                ));
            }
        }
    };
    central.scanner().stop().await;
    found?;

    info!("target discovered");
    Ok(address)
}

fn contains(nearby: &[Arc<Peripheral>], address: &PeripheralAddress) -> bool {
    nearby.iter().any(|peripheral| peripheral.address() == address)
}
