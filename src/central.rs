use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::cache::PeripheralCache;
use crate::config::CentralConfig;
use crate::connection::ConnectionManager;
use crate::hw::{BlePlatform, PlatformEvent};
use crate::l2cap::L2capChannel;
use crate::model::PeripheralAddress;
use crate::permissions::{AllPermissionsGranted, PermissionChecker};
use crate::scanner::Scanner;
use crate::timer::TimerPool;

/// Entry point owning one platform and everything that reacts to its events.
///
/// A single pump task drains the platform event stream in order, sending
/// advertisements to the scanner and everything else to the connection
/// manager. Dropping the central stops the pump and every timer.
#[derive(Debug)]
pub struct Central {
    platform: Arc<dyn BlePlatform>,
    cache: Arc<PeripheralCache>,
    timers: TimerPool,
    connections: ConnectionManager,
    scanner: Scanner,
    pump: JoinHandle<()>,
}

impl Central {
    /// Creates a central with every permission granted. Must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn new(platform: Arc<dyn BlePlatform>, config: CentralConfig) -> Self {
        Self::with_permissions(platform, config, Arc::new(AllPermissionsGranted))
    }

    #[must_use]
    pub fn with_permissions(
        platform: Arc<dyn BlePlatform>,
        config: CentralConfig,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let cache = Arc::new(PeripheralCache::new());
        let timers = TimerPool::new();
        let connections = ConnectionManager::new(
            Arc::clone(&platform),
            Arc::clone(&cache),
            Arc::clone(&permissions),
            timers.clone(),
            config,
        );
        let scanner = Scanner::new(
            Arc::clone(&platform),
            Arc::clone(&cache),
            permissions,
            timers.clone(),
            config,
        );

        let (sink, events) = mpsc::unbounded_channel();
        platform.attach(sink);
        let pump = tokio::spawn(pump_events(events, connections.clone(), scanner.clone()));

        Self {
            platform,
            cache,
            timers,
            connections,
            scanner,
            pump,
        }
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    #[must_use]
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PeripheralCache> {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &CentralConfig {
        self.connections.config()
    }

    /// Creates an unopened L2CAP channel to `address`.
    #[must_use]
    pub fn l2cap_channel(&self, address: PeripheralAddress) -> L2capChannel {
        L2capChannel::new(address, Arc::clone(&self.platform))
    }
}

impl Drop for Central {
    fn drop(&mut self) {
        self.pump.abort();
        self.timers.cancel_all();
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<PlatformEvent>,
    connections: ConnectionManager,
    scanner: Scanner,
) {
    while let Some(event) = events.recv().await {
        match event {
            PlatformEvent::Advertisement(advertisement) => {
                scanner.handle_advertisement(advertisement);
            }
            other => connections.handle_event(other),
        }
    }
    trace!("platform event stream closed");
}
