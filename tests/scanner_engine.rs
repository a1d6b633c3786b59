use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uubluetooth::{
    BleError, Central, CentralConfig, FakeDevice, FakePlatform, FakePlatformConfig,
    InclusionFilter, InclusionVerdict, MinimumRssiFilter, NamePrefixFilter, OutOfRangeFilter,
    Peripheral, PeripheralAddress, RangeVerdict, ScanEvent, ScanSettings, ScanThrottlePolicy,
    StaleAdvertisementFilter, ThrottledStartBehaviour,
};

const WEAK: &str = "AA:BB:CC:DD:EE:01";
const STRONG: &str = "AA:BB:CC:DD:EE:02";
const MEDIUM: &str = "AA:BB:CC:DD:EE:03";

fn devices() -> Vec<FakeDevice> {
    vec![
        FakeDevice::new(WEAK, Some("UU-Weak"), -81),
        FakeDevice::new(STRONG, Some("UU-Strong"), -39),
        FakeDevice::new(MEDIUM, Some("Kettle"), -60),
    ]
}

fn central_with(
    platform: FakePlatformConfig,
    config: CentralConfig,
) -> (Arc<FakePlatform>, Central) {
    let platform = Arc::new(FakePlatform::new(platform));
    let central = Central::new(platform.clone(), config);
    (platform, central)
}

fn central(platform: FakePlatformConfig) -> (Arc<FakePlatform>, Central) {
    central_with(platform, CentralConfig::default())
}

fn observed_settings() -> (ScanSettings, UnboundedReceiver<ScanEvent>) {
    filtered_settings(Vec::new(), Vec::new())
}

fn filtered_settings(
    inclusion_filters: Vec<Arc<dyn InclusionFilter>>,
    out_of_range_filters: Vec<Arc<dyn OutOfRangeFilter>>,
) -> (ScanSettings, UnboundedReceiver<ScanEvent>) {
    let (observer, events) = mpsc::unbounded_channel();
    let settings = ScanSettings::builder()
        .inclusion_filters(inclusion_filters)
        .out_of_range_filters(out_of_range_filters)
        .observer(Arc::new(observer))
        .build();
    (settings, events)
}

fn addresses(nearby: &[Arc<Peripheral>]) -> Vec<&str> {
    nearby
        .iter()
        .map(|peripheral| peripheral.address().as_str())
        .collect()
}

async fn next_event(events: &mut UnboundedReceiver<ScanEvent>) -> ScanEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("scan event should arrive")
        .expect("observer channel should stay open")
}

/// Waits for the next list change, skipping lifecycle events.
async fn next_list(events: &mut UnboundedReceiver<ScanEvent>) -> Vec<Arc<Peripheral>> {
    loop {
        if let ScanEvent::ListChanged(nearby) = next_event(events).await {
            return nearby;
        }
    }
}

fn drain(events: &mut UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn nearby_list_is_sorted_strongest_first() {
    let (platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let (settings, mut events) = observed_settings();

    central.scanner().start(settings).await;

    assert_eq!(ScanEvent::Started, next_event(&mut events).await);
    let mut nearby = next_list(&mut events).await;
    while nearby.len() < 3 {
        nearby = next_list(&mut events).await;
    }
    assert_eq!(vec![STRONG, MEDIUM, WEAK], addresses(&nearby));
    assert_eq!(vec![STRONG, MEDIUM, WEAK], addresses(&central.scanner().nearby()));
    assert!(central.scanner().is_scanning());
    assert_eq!(1, platform.scan_start_count());
}

#[tokio::test(start_paused = true)]
async fn rssi_update_reorders_nearby_list() {
    let (platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let (settings, mut events) = observed_settings();
    central.scanner().start(settings).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    drain(&mut events);

    platform.advertise(&PeripheralAddress::from(WEAK), -20);

    assert_eq!(vec![WEAK, STRONG, MEDIUM], addresses(&next_list(&mut events).await));
}

#[tokio::test(start_paused = true)]
async fn ignore_forever_skips_peripheral_for_rest_of_session() {
    let (platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let evaluations = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&evaluations);
    let kettle = PeripheralAddress::from(MEDIUM);
    let inclusion_filters: Vec<Arc<dyn InclusionFilter>> = vec![
        Arc::new(move |peripheral: &Peripheral| {
            if peripheral.address().as_str() == MEDIUM {
                counted.fetch_add(1, Ordering::SeqCst);
            }
            InclusionVerdict::Accept
        }),
        Arc::new(NamePrefixFilter {
            prefix: "UU-".to_string(),
        }),
    ];
    let (settings, mut events) = filtered_settings(inclusion_filters, Vec::new());

    central.scanner().start(settings).await;
    platform.advertise(&kettle, -30);
    platform.advertise(&kettle, -30);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(vec![STRONG, WEAK], addresses(&central.scanner().nearby()));
    assert_eq!(1, evaluations.load(Ordering::SeqCst));
    let lists: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ScanEvent::ListChanged(nearby) => Some(nearby),
            _ => None,
        })
        .collect();
    assert!(lists.iter().all(|nearby| !addresses(nearby).contains(&MEDIUM)));

    let (settings, _events) = observed_settings();
    central.scanner().start(settings).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(3, central.scanner().nearby().len());
}

#[tokio::test(start_paused = true)]
async fn ignore_once_reevaluates_next_advertisement() {
    let (platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let inclusion_filters: Vec<Arc<dyn InclusionFilter>> =
        vec![Arc::new(MinimumRssiFilter { min_rssi: -70 })];
    let (settings, mut events) = filtered_settings(inclusion_filters, Vec::new());

    central.scanner().start(settings).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(vec![STRONG, MEDIUM], addresses(&central.scanner().nearby()));
    drain(&mut events);

    platform.advertise(&PeripheralAddress::from(WEAK), -50);

    assert_eq!(
        vec![STRONG, WEAK, MEDIUM],
        addresses(&next_list(&mut events).await)
    );
}

#[tokio::test(start_paused = true)]
async fn throttled_start_is_deferred_until_window_allows() {
    let config = CentralConfig::builder()
        .scan_throttle(
            ScanThrottlePolicy::builder()
                .max_starts(2)
                .window(Duration::from_secs(30))
                .build(),
        )
        .build();
    let (platform, central) =
        central_with(FakePlatformConfig::builder().devices(devices()).build(), config);

    for _ in 0..2 {
        let (settings, _events) = observed_settings();
        central.scanner().start(settings).await;
        central.scanner().stop().await;
    }
    let (settings, mut events) = observed_settings();
    central.scanner().start(settings).await;

    assert_eq!(
        ScanEvent::StartDeferred(Duration::from_secs(30)),
        next_event(&mut events).await
    );
    assert_eq!(2, platform.scan_start_count());
    assert!(!central.scanner().is_scanning());

    assert_eq!(ScanEvent::Started, next_event(&mut events).await);
    assert_eq!(3, platform.scan_start_count());
    assert!(central.scanner().is_scanning());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_deferred_start() {
    let config = CentralConfig::builder()
        .scan_throttle(ScanThrottlePolicy::builder().max_starts(1).build())
        .build();
    let (platform, central) =
        central_with(FakePlatformConfig::builder().devices(devices()).build(), config);
    let (settings, _first) = observed_settings();
    central.scanner().start(settings).await;
    let (settings, mut events) = observed_settings();
    central.scanner().start(settings).await;
    assert_matches!(next_event(&mut events).await, ScanEvent::StartDeferred(_));

    central.scanner().stop().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(vec![ScanEvent::Ended(None)], drain(&mut events));
    assert_eq!(1, platform.scan_start_count());
}

#[tokio::test(start_paused = true)]
async fn throttled_start_is_rejected_when_configured() {
    let config = CentralConfig::builder()
        .scan_throttle(ScanThrottlePolicy::builder().max_starts(1).build())
        .throttled_start(ThrottledStartBehaviour::Reject)
        .build();
    let (platform, central) =
        central_with(FakePlatformConfig::builder().devices(devices()).build(), config);
    let (settings, _first) = observed_settings();
    central.scanner().start(settings).await;
    central.scanner().stop().await;

    let (settings, mut events) = observed_settings();
    central.scanner().start(settings).await;

    assert_matches!(
        next_event(&mut events).await,
        ScanEvent::Ended(Some(BleError::RateLimited { retry_after }))
            if retry_after == Duration::from_secs(30)
    );
    assert_eq!(1, platform.scan_start_count());
}

#[tokio::test(start_paused = true)]
async fn unlimited_throttle_never_defers() {
    let config = CentralConfig::builder()
        .scan_throttle(ScanThrottlePolicy::unlimited())
        .build();
    let (platform, central) = central_with(FakePlatformConfig::default(), config);

    for _ in 0..10 {
        let (settings, mut events) = observed_settings();
        central.scanner().start(settings).await;
        assert_eq!(ScanEvent::Started, next_event(&mut events).await);
    }
    assert_eq!(10, platform.scan_start_count());
}

#[tokio::test(start_paused = true)]
async fn stale_peripherals_are_evicted_with_one_list_change() {
    let (_platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let out_of_range_filters: Vec<Arc<dyn OutOfRangeFilter>> = vec![Arc::new(
        StaleAdvertisementFilter {
            max_age: Duration::from_secs(2),
        },
    )];
    let (settings, mut events) = filtered_settings(Vec::new(), out_of_range_filters);
    central.scanner().start(settings).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    drain(&mut events);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(vec![ScanEvent::ListChanged(Vec::new())], drain(&mut events));
    assert!(central.scanner().is_scanning());
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_nearby_list_and_drops_late_advertisements() {
    let (platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let (settings, mut events) = observed_settings();
    central.scanner().start(settings).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    central.scanner().stop().await;
    platform.advertise(&PeripheralAddress::from(WEAK), -10);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_matches!(drain(&mut events).last(), Some(ScanEvent::Ended(None)));
    assert_eq!(vec![STRONG, MEDIUM, WEAK], addresses(&central.scanner().nearby()));
    assert!(!central.scanner().is_scanning());
    assert!(!platform.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn scan_without_permission_ends_immediately() {
    let platform = Arc::new(FakePlatform::new(
        FakePlatformConfig::builder().devices(devices()).build(),
    ));
    let central = Central::with_permissions(
        platform.clone(),
        CentralConfig::default(),
        Arc::new(uubluetooth::FixedPermissionStatus(
            uubluetooth::PermissionStatus::CanRequest,
        )),
    );
    let (settings, mut events) = observed_settings();

    central.scanner().start(settings).await;

    assert_matches!(
        next_event(&mut events).await,
        ScanEvent::Ended(Some(BleError::InsufficientPermissions { .. }))
    );
    assert_eq!(0, platform.scan_start_count());
}

#[tokio::test(start_paused = true)]
async fn filters_may_query_the_scanner() {
    let (_platform, central) = central(FakePlatformConfig::builder().devices(devices()).build());
    let queries = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&queries);
    let scanner = central.scanner().clone();
    let inclusion_filters: Vec<Arc<dyn InclusionFilter>> =
        vec![Arc::new(move |peripheral: &Peripheral| {
            let known = scanner
                .nearby()
                .iter()
                .any(|nearby| nearby.address() == peripheral.address());
            if !known || scanner.is_scanning() {
                counted.fetch_add(1, Ordering::SeqCst);
            }
            InclusionVerdict::Accept
        })];
    let scanner = central.scanner().clone();
    let out_of_range_filters: Vec<Arc<dyn OutOfRangeFilter>> =
        vec![Arc::new(move |peripheral: &Peripheral, _now: tokio::time::Instant| {
            if scanner.is_scanning() && peripheral.address().as_str() == WEAK {
                RangeVerdict::OutOfRange
            } else {
                RangeVerdict::InRange
            }
        })];
    let (settings, mut events) = filtered_settings(inclusion_filters, out_of_range_filters);

    central.scanner().start(settings).await;
    let mut nearby = next_list(&mut events).await;
    while nearby.len() < 3 {
        nearby = next_list(&mut events).await;
    }
    assert_eq!(vec![STRONG, MEDIUM, WEAK], addresses(&nearby));
    assert!(queries.load(Ordering::SeqCst) >= 3);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(vec![STRONG, MEDIUM], addresses(&central.scanner().nearby()));
}
