use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bon::Builder;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use super::filters::{InclusionFilter, InclusionVerdict, OutOfRangeFilter, RangeVerdict};
use super::throttle::ScanStartThrottle;
use crate::cache::PeripheralCache;
use crate::config::{CentralConfig, ThrottledStartBehaviour};
use crate::error::BleError;
use crate::hw::BlePlatform;
use crate::model::{Advertisement, Peripheral, PeripheralAddress};
use crate::permissions::{Permission, PermissionChecker};
use crate::timer::TimerPool;

const OUT_OF_RANGE_TIMER: &str = "scanner__OutOfRange";
const RESTART_TIMER: &str = "scanner__Restart";

/// Receives scan session notifications, in the order they were produced.
pub trait ScanObserver: Send + Sync {
    fn started(&self) {}

    /// The session is over; `None` means it was stopped normally.
    fn ended(&self, _error: Option<BleError>) {}

    /// Nearby peripherals, strongest signal first.
    fn list_changed(&self, _nearby: Vec<Arc<Peripheral>>) {}

    /// The start hit the throttle and will be retried after `delay`.
    fn start_deferred(&self, _delay: Duration) {}
}

/// A scan notification as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Started,
    Ended(Option<BleError>),
    ListChanged(Vec<Arc<Peripheral>>),
    StartDeferred(Duration),
}

impl ScanEvent {
    fn deliver_to(self, observer: &dyn ScanObserver) {
        match self {
            Self::Started => observer.started(),
            Self::Ended(error) => observer.ended(error),
            Self::ListChanged(nearby) => observer.list_changed(nearby),
            Self::StartDeferred(delay) => observer.start_deferred(delay),
        }
    }
}

/// Forwards every notification as a [`ScanEvent`].
impl ScanObserver for mpsc::UnboundedSender<ScanEvent> {
    fn started(&self) {
        let _ = self.send(ScanEvent::Started);
    }

    fn ended(&self, error: Option<BleError>) {
        let _ = self.send(ScanEvent::Ended(error));
    }

    fn list_changed(&self, nearby: Vec<Arc<Peripheral>>) {
        let _ = self.send(ScanEvent::ListChanged(nearby));
    }

    fn start_deferred(&self, delay: Duration) {
        let _ = self.send(ScanEvent::StartDeferred(delay));
    }
}

/// Parameters of one scan session.
#[derive(Clone, Builder)]
pub struct ScanSettings {
    /// Platform-level service filter; empty scans for everything.
    #[builder(default)]
    service_uuids: Vec<String>,
    #[builder(default)]
    inclusion_filters: Vec<Arc<dyn InclusionFilter>>,
    #[builder(default)]
    out_of_range_filters: Vec<Arc<dyn OutOfRangeFilter>>,
    observer: Arc<dyn ScanObserver>,
}

impl fmt::Debug for ScanSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSettings")
            .field("service_uuids", &self.service_uuids)
            .field("inclusion_filters", &self.inclusion_filters.len())
            .field("out_of_range_filters", &self.out_of_range_filters.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
enum Phase {
    #[default]
    Idle,
    Starting,
    Deferred,
    Scanning,
}

struct Delivery {
    observer: Arc<dyn ScanObserver>,
    event: ScanEvent,
}

struct ScannerState {
    phase: Phase,
    /// Bumped on every start and stop so late platform results can be discarded.
    session: u64,
    settings: Option<ScanSettings>,
    nearby: HashMap<PeripheralAddress, Arc<Peripheral>>,
    ignored: HashSet<PeripheralAddress>,
    throttle: ScanStartThrottle,
}

impl ScannerState {
    fn accepts_advertisements(&self) -> bool {
        matches!(self.phase, Phase::Starting | Phase::Scanning)
    }

    fn sorted_nearby(&self) -> Vec<Arc<Peripheral>> {
        let mut nearby: Vec<_> = self.nearby.values().cloned().collect();
        nearby.sort_by(|left, right| {
            right
                .rssi()
                .cmp(&left.rssi())
                .then_with(|| left.address().cmp(right.address()))
        });
        nearby
    }
}

struct Shared {
    platform: Arc<dyn BlePlatform>,
    cache: Arc<PeripheralCache>,
    permissions: Arc<dyn PermissionChecker>,
    timers: TimerPool,
    config: CentralConfig,
    state: Mutex<ScannerState>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Shared {
    /// Queues an event. Called with the state lock held so deliveries keep
    /// the order in which the state changed.
    fn enqueue(&self, observer: &Arc<dyn ScanObserver>, event: ScanEvent) {
        let delivery = Delivery {
            observer: Arc::clone(observer),
            event,
        };
        if self.deliveries.send(delivery).is_err() {
            trace!("scan delivery task has stopped");
        }
    }
}

/// Scan session driver: filters advertisements into a nearby list, evicts
/// peripherals that go out of range and throttles platform scan starts.
#[derive(Clone)]
pub struct Scanner {
    shared: Arc<Shared>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Scanner")
            .field("phase", &state.phase)
            .field("nearby", &state.nearby.len())
            .field("ignored", &state.ignored.len())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a scanner and its delivery task. Must be called from within a
    /// Tokio runtime.
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        cache: Arc<PeripheralCache>,
        permissions: Arc<dyn PermissionChecker>,
        timers: TimerPool,
        config: CentralConfig,
    ) -> Self {
        let (deliveries, mut receiver) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            while let Some(Delivery { observer, event }) = receiver.recv().await {
                event.deliver_to(observer.as_ref());
            }
        });

        Self {
            shared: Arc::new(Shared {
                platform,
                cache,
                permissions,
                timers,
                state: Mutex::new(ScannerState {
                    phase: Phase::Idle,
                    session: 0,
                    settings: None,
                    nearby: HashMap::new(),
                    ignored: HashSet::new(),
                    throttle: ScanStartThrottle::new(config.scan_throttle),
                }),
                config,
                deliveries,
            }),
        }
    }

    /// Whether the platform is currently scanning for this scanner.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.shared.state.lock().phase == Phase::Scanning
    }

    /// Current nearby list, strongest signal first.
    #[must_use]
    pub fn nearby(&self) -> Vec<Arc<Peripheral>> {
        self.shared.state.lock().sorted_nearby()
    }

    /// Starts a new session, ending any previous one first.
    ///
    /// Outcomes are reported to the settings' observer: `started`,
    /// `start_deferred` when throttled, or `ended` with the failure.
    #[instrument(skip_all, level = "debug", fields(services = settings.service_uuids.len()))]
    pub async fn start(&self, settings: ScanSettings) {
        if !self.shared.permissions.check(Permission::Scan).is_granted() {
            warn!("scan permission not granted");
            self.shared.enqueue(
                &settings.observer,
                ScanEvent::Ended(Some(BleError::InsufficientPermissions {
                    permission: Permission::Scan.to_string(),
                })),
            );
            return;
        }

        self.end_session().await;

        let session = {
            let mut state = self.shared.state.lock();
            state.session += 1;
            state.phase = Phase::Starting;
            state.nearby.clear();
            state.ignored.clear();
            state.settings = Some(settings);
            state.session
        };
        launch(&self.shared, session).await;
    }

    /// Stops the current session. The nearby list is kept until the next
    /// start.
    #[instrument(skip_all, level = "debug")]
    pub async fn stop(&self) {
        self.end_session().await;
    }

    async fn end_session(&self) {
        let was_scanning = {
            let mut state = self.shared.state.lock();
            let Some(settings) = state.settings.take() else {
                return;
            };
            self.shared.timers.cancel_timer(OUT_OF_RANGE_TIMER);
            self.shared.timers.cancel_timer(RESTART_TIMER);
            state.session += 1;
            let previous = std::mem::take(&mut state.phase);
            self.shared.enqueue(&settings.observer, ScanEvent::Ended(None));
            previous == Phase::Scanning
        };

        if was_scanning {
            if let Err(error) = self.shared.platform.stop_scan().await {
                warn!(%error, "failed to stop platform scan");
            }
        }
        debug!("scan session ended");
    }

    /// Feeds one advertisement through the ignore set and inclusion filters.
    ///
    /// Results that arrive while the platform start is still in flight are
    /// kept, and reported right after `Started`. Filters run without the
    /// scanner lock held.
    pub fn handle_advertisement(&self, advertisement: Advertisement) {
        let shared = &self.shared;
        let (session, settings) = {
            let state = shared.state.lock();
            if !state.accepts_advertisements() {
                trace!(address = %advertisement.address(), "advertisement outside a scan session");
                return;
            }
            if state.ignored.contains(advertisement.address()) {
                return;
            }
            let Some(settings) = state.settings.clone() else {
                return;
            };
            (state.session, settings)
        };

        let peripheral = shared.cache.observe(advertisement);
        let verdict = settings
            .inclusion_filters
            .iter()
            .map(|filter| filter.evaluate(&peripheral))
            .find(|verdict| *verdict != InclusionVerdict::Accept)
            .unwrap_or(InclusionVerdict::Accept);

        let mut state = shared.state.lock();
        let address = peripheral.address().clone();
        if state.session != session
            || !state.accepts_advertisements()
            || state.ignored.contains(&address)
        {
            trace!(%address, "scan session changed while filtering");
            return;
        }
        match verdict {
            InclusionVerdict::IgnoreOnce => return,
            InclusionVerdict::IgnoreForever => {
                debug!(%address, "ignoring peripheral for this session");
                state.ignored.insert(address.clone());
                if state.nearby.remove(&address).is_none() {
                    return;
                }
            }
            InclusionVerdict::Accept => {
                state.nearby.insert(address, peripheral);
            }
        }
        if state.phase == Phase::Scanning {
            let nearby = state.sorted_nearby();
            shared.enqueue(&settings.observer, ScanEvent::ListChanged(nearby));
        }
    }
}

/// Issues the platform start for `session`, or defers/rejects it when the
/// throttle is exhausted.
async fn launch(shared: &Arc<Shared>, session: u64) {
    let Some(settings) = acquire_start(shared, session) else {
        return;
    };

    let result = shared.platform.start_scan(&settings.service_uuids).await;
    let started = result.is_ok();
    if !finish_start(shared, session, &settings, result) && started {
        debug!("scan session replaced while starting; stopping platform scan");
        if let Err(error) = shared.platform.stop_scan().await {
            warn!(%error, "failed to stop stale platform scan");
        }
    }
}

/// Takes a throttle slot for `session`. Returns the settings to start with,
/// or `None` when the start was deferred, rejected or superseded.
fn acquire_start(shared: &Arc<Shared>, session: u64) -> Option<ScanSettings> {
    let mut state = shared.state.lock();
    if state.session != session {
        return None;
    }
    let settings = state.settings.clone()?;
    let delay = match state.throttle.try_acquire(Instant::now()) {
        Ok(()) => {
            state.phase = Phase::Starting;
            return Some(settings);
        }
        Err(delay) => delay,
    };

    match shared.config.throttled_start {
        ThrottledStartBehaviour::Defer => {
            info!(?delay, "scan start throttled; deferring");
            state.phase = Phase::Deferred;
            shared.enqueue(&settings.observer, ScanEvent::StartDeferred(delay));
            let weak = Arc::downgrade(shared);
            shared
                .timers
                .start_timer(RESTART_TIMER, delay, false, move || {
                    let weak = Weak::clone(&weak);
                    tokio::spawn(async move {
                        if let Some(shared) = weak.upgrade() {
                            launch(&shared, session).await;
                        }
                    });
                });
        }
        ThrottledStartBehaviour::Reject => {
            info!(?delay, "scan start throttled; rejecting");
            state.phase = Phase::Idle;
            state.settings = None;
            shared.enqueue(
                &settings.observer,
                ScanEvent::Ended(Some(BleError::RateLimited { retry_after: delay })),
            );
        }
    }
    None
}

/// Applies the platform start result. Returns `false` when the session was
/// replaced while the platform call was in flight.
fn finish_start(
    shared: &Arc<Shared>,
    session: u64,
    settings: &ScanSettings,
    result: Result<(), BleError>,
) -> bool {
    let mut state = shared.state.lock();
    if state.session != session {
        return false;
    }

    match result {
        Ok(()) => {
            state.phase = Phase::Scanning;
            shared.enqueue(&settings.observer, ScanEvent::Started);
            if !state.nearby.is_empty() {
                let nearby = state.sorted_nearby();
                shared.enqueue(&settings.observer, ScanEvent::ListChanged(nearby));
            }
            let weak = Arc::downgrade(shared);
            shared.timers.start_timer(
                OUT_OF_RANGE_TIMER,
                shared.config.out_of_range_period,
                true,
                move || {
                    if let Some(shared) = weak.upgrade() {
                        evict_out_of_range(&shared);
                    }
                },
            );
            info!("scan started");
        }
        Err(error) => {
            warn!(%error, "platform scan start failed");
            state.phase = Phase::Idle;
            state.settings = None;
            state.nearby.clear();
            shared.enqueue(&settings.observer, ScanEvent::Ended(Some(error)));
        }
    }
    true
}

fn evict_out_of_range(shared: &Shared) {
    let (session, settings, nearby) = {
        let state = shared.state.lock();
        if state.phase != Phase::Scanning {
            return;
        }
        let Some(settings) = state.settings.clone() else {
            return;
        };
        if settings.out_of_range_filters.is_empty() {
            return;
        }
        (state.session, settings, state.nearby.values().cloned().collect::<Vec<_>>())
    };

    let now = Instant::now();
    let out_of_range: Vec<Arc<Peripheral>> = nearby
        .into_iter()
        .filter(|peripheral| {
            settings
                .out_of_range_filters
                .iter()
                .any(|filter| filter.evaluate(peripheral, now) == RangeVerdict::OutOfRange)
        })
        .collect();
    if out_of_range.is_empty() {
        return;
    }

    let mut state = shared.state.lock();
    if state.session != session || state.phase != Phase::Scanning {
        return;
    }
    let mut evicted = 0_usize;
    for peripheral in &out_of_range {
        // Skip records replaced by a newer advertisement while filters ran.
        if state
            .nearby
            .get(peripheral.address())
            .is_some_and(|current| Arc::ptr_eq(current, peripheral))
        {
            state.nearby.remove(peripheral.address());
            evicted += 1;
        }
    }
    if evicted == 0 {
        return;
    }
    debug!(count = evicted, "evicted out-of-range peripherals");
    let nearby = state.sorted_nearby();
    shared.enqueue(&settings.observer, ScanEvent::ListChanged(nearby));
}
