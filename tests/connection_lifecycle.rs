use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uubluetooth::{
    BleError, Central, CentralConfig, ConnectBehaviour, ConnectionState, FakeDevice, FakePlatform,
    FakePlatformConfig, GattStatus, KnownAttribute, PeripheralAddress, PipelineError,
    SetupPipeline, StepOutcome, WriteType, known_uuid,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

fn devices() -> Vec<FakeDevice> {
    vec![FakeDevice::new(ADDRESS, Some("UU-Sensor"), -48)]
}

fn fixture() -> FakePlatformConfig {
    FakePlatformConfig::builder().devices(devices()).build()
}

fn central(config: FakePlatformConfig) -> (Arc<FakePlatform>, Central) {
    let platform = Arc::new(FakePlatform::new(config));
    let central = Central::new(platform.clone(), CentralConfig::default());
    (platform, central)
}

fn battery_level() -> String {
    known_uuid(KnownAttribute::BatteryLevel)
}

#[tokio::test(start_paused = true)]
async fn connect_then_disconnect_ends_session_cleanly() -> anyhow::Result<()> {
    let (platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();

    let (peripheral, link) = connections.connect_async(&address).await?;
    assert_eq!(ConnectionState::Connected, peripheral.connection_state());
    assert!(platform.is_linked(&address));

    connections.disconnect_async(&address).await?;

    assert_eq!(None, link.wait().await);
    assert_eq!(
        ConnectionState::Disconnected,
        connections.connection_state(&address)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_to_linked_device_is_rejected() -> anyhow::Result<()> {
    let (platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;
    let (outcome_tx, mut outcome) = mpsc::unbounded_channel();

    connections.connect(
        &address,
        Duration::from_secs(3),
        |_| panic!("an established link must not be reported again"),
        move |error| {
            let _ = outcome_tx.send(error);
        },
    );

    assert_matches!(
        outcome.recv().await,
        Some(Some(BleError::AlreadyConnected { address: rejected })) if rejected == address
    );
    assert_eq!(1, platform.connect_count());
    assert_eq!(ConnectionState::Connected, connections.connection_state(&address));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_connect_is_rejected_and_first_attempt_times_out() {
    let (platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .connect_behaviour(ConnectBehaviour::NeverRespond)
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();

    for attempt in ["first", "second"] {
        let on_disconnected = outcomes_tx.clone();
        connections.connect(
            &address,
            Duration::from_secs(3),
            |_| panic!("no attempt should connect"),
            move |error| {
                let _ = on_disconnected.send((attempt, error));
            },
        );
    }

    assert_matches!(
        outcomes.recv().await,
        Some(("second", Some(BleError::AlreadyConnected { .. })))
    );
    assert_eq!(ConnectionState::Connecting, connections.connection_state(&address));

    assert_matches!(
        outcomes.recv().await,
        Some(("first", Some(BleError::Timeout { timeout, .. })))
            if timeout == Duration::from_secs(3)
    );
    assert_eq!(1, platform.connect_count());
    assert_eq!(
        ConnectionState::Disconnected,
        connections.connection_state(&address)
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(1, platform.disconnect_count());
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_connect_cancels_attempt_with_error() -> anyhow::Result<()> {
    let (platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .connect_behaviour(ConnectBehaviour::NeverRespond)
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (outcome_tx, mut outcome) = mpsc::unbounded_channel();

    connections.connect(
        &address,
        Duration::from_secs(30),
        |_| panic!("a cancelled attempt must not connect"),
        move |error| {
            let _ = outcome_tx.send(error);
        },
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ConnectionState::Connecting, connections.connection_state(&address));

    connections.disconnect_async(&address).await?;

    assert_matches!(
        outcome.recv().await,
        Some(Some(BleError::PlatformOperationFailed { reason, .. }))
            if reason == "cancelled by disconnect"
    );
    assert_eq!(1, platform.disconnect_count());
    assert_eq!(
        ConnectionState::Disconnected,
        connections.connection_state(&address)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_to_unregistered_device_fails_precondition() {
    let (platform, central) = central(fixture());
    let address = PeripheralAddress::from("00:00:00:00:00:00");

    let result = central.connections().connect_async(&address).await;

    assert_matches!(
        result,
        Err(BleError::PreconditionFailed { address: rejected }) if rejected == address
    );
    assert_eq!(0, platform.connect_count());
}

#[tokio::test(start_paused = true)]
async fn connect_without_permission_is_refused() {
    let platform = Arc::new(FakePlatform::new(fixture()));
    let central = Central::with_permissions(
        platform.clone(),
        CentralConfig::default(),
        Arc::new(uubluetooth::FixedPermissionStatus(
            uubluetooth::PermissionStatus::Denied,
        )),
    );

    let result = central
        .connections()
        .connect_async(&PeripheralAddress::from(ADDRESS))
        .await;

    assert_matches!(result, Err(BleError::InsufficientPermissions { .. }));
    assert_eq!(0, platform.connect_count());
}

#[tokio::test(start_paused = true)]
async fn failed_attempt_reports_platform_status() {
    let (_platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .connect_behaviour(ConnectBehaviour::Fail {
                status: GattStatus::GattError,
            })
            .build(),
    );

    let result = central
        .connections()
        .connect_async(&PeripheralAddress::from(ADDRESS))
        .await;

    assert_matches!(
        result,
        Err(BleError::PlatformOperationFailed {
            status: Some(133),
            ..
        })
    );
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_pending_operations_and_reports_session_error() -> anyhow::Result<()> {
    let (platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .unresponsive(HashSet::from([battery_level()]))
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_, link) = connections.connect_async(&address).await?;

    let (read_tx, mut read) = mpsc::unbounded_channel();
    connections.read_characteristic(&address, &battery_level(), move |result| {
        let _ = read_tx.send(result);
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    platform.drop_link(&address, GattStatus::PeerTerminated);

    assert_eq!(
        Some(Err(BleError::NotConnected {
            address: address.clone()
        })),
        read.recv().await
    );
    assert_matches!(
        link.wait().await,
        Some(BleError::PlatformOperationFailed {
            status: Some(19),
            ..
        })
    );
    assert_matches!(
        connections.read_rssi_async(&address).await,
        Err(BleError::NotConnected { .. })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn normal_link_drop_ends_session_without_error() -> anyhow::Result<()> {
    let (platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let (_, link) = central.connections().connect_async(&address).await?;

    platform.drop_link(&address, GattStatus::LocalTerminated);

    assert_eq!(None, link.wait().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unanswered_read_times_out_and_link_stays_up() -> anyhow::Result<()> {
    let (_platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .unresponsive(HashSet::from([battery_level()]))
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_link_peripheral, _link) = connections.connect_async(&address).await?;

    let result = connections
        .read_characteristic_async(&address, &battery_level())
        .await;

    assert_matches!(
        result,
        Err(BleError::Timeout { timeout, .. })
            if timeout == CentralConfig::default().operation_timeout
    );
    assert_eq!(
        ConnectionState::Connected,
        connections.connection_state(&address)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_operation_on_same_key_is_rejected() -> anyhow::Result<()> {
    let (_platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .unresponsive(HashSet::from([battery_level()]))
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;

    connections.read_characteristic(&address, &battery_level(), |_| {});
    let second = connections
        .read_characteristic_async(&address, &battery_level().to_uppercase())
        .await;

    assert_matches!(
        second,
        Err(BleError::OperationInProgress { key }) if key.contains("ReadCharacteristic")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gatt_operations_round_trip_through_fake_peripheral() -> anyhow::Result<()> {
    let (_platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;

    let services = connections.discover_services_async(&address).await?;
    assert!(
        services
            .iter()
            .any(|service| service.characteristic(&battery_level()).is_some())
    );

    connections
        .write_characteristic_async(&address, &battery_level(), vec![42], WriteType::WithResponse)
        .await?;
    assert_eq!(
        vec![42],
        connections
            .read_characteristic_async(&address, &battery_level())
            .await?
    );

    let cccd = known_uuid(KnownAttribute::ClientCharacteristicConfiguration);
    connections
        .write_descriptor_async(&address, &battery_level(), &cccd, vec![0x01, 0x00])
        .await?;
    assert_eq!(
        vec![0x01, 0x00],
        connections
            .read_descriptor_async(&address, &battery_level(), &cccd)
            .await?
    );

    assert_eq!(185, connections.request_mtu_async(&address, 185).await?);
    assert_eq!(-48, connections.read_rssi_async(&address).await?);
    let peripheral = connections.peripheral(&address).expect("cached peripheral");
    assert_eq!(Some(185), peripheral.mtu());
    assert_eq!(Some(-48), peripheral.rssi());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_data_handler_until_disabled() -> anyhow::Result<()> {
    let (platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;
    let (values_tx, mut values) = mpsc::unbounded_channel();

    let enabled = connections
        .set_notify_async(
            &address,
            &battery_level(),
            true,
            Some(Arc::new(move |value: Vec<u8>| {
                let _ = values_tx.send(value);
            })),
        )
        .await?;
    assert!(enabled);

    platform.notify_value(&address, &battery_level(), vec![55]);
    assert_eq!(Some(vec![55]), values.recv().await);

    connections
        .set_notify_async(&address, &battery_level(), false, None)
        .await?;
    platform.notify_value(&address, &battery_level(), vec![56]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(values.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_watchdog_reports_timeout_to_caller_only() -> anyhow::Result<()> {
    let (_platform, central) = central(FakePlatformConfig::builder()
            .devices(devices()).answer_disconnects(false).build());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, link) = connections.connect_async(&address).await?;

    let result = connections.disconnect_async(&address).await;

    assert_matches!(result, Err(BleError::Timeout { .. }));
    assert_eq!(None, link.wait().await);
    assert_eq!(
        ConnectionState::Disconnected,
        connections.connection_state(&address)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn setup_pipeline_runs_steps_in_order() -> anyhow::Result<()> {
    let (_platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;
    connections.discover_services_async(&address).await?;

    let pipeline = SetupPipeline::new()
        .request_mtu(512)
        .write(battery_level(), vec![12], WriteType::WithoutResponse)
        .read(battery_level())
        .subscribe(battery_level(), Arc::new(|_value: Vec<u8>| {}));

    let outcomes = pipeline
        .run(connections, &address, &CancellationToken::new())
        .await?;

    assert_eq!(
        vec![
            StepOutcome::Mtu(247),
            StepOutcome::Written,
            StepOutcome::Read(vec![12]),
            StepOutcome::NotifySet(true),
        ],
        outcomes
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn setup_pipeline_stops_at_first_failure() -> anyhow::Result<()> {
    let (_platform, central) = central(fixture());
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;

    let result = SetupPipeline::new()
        .read(battery_level())
        .read("0000fff1-0000-1000-8000-00805f9b34fb")
        .request_mtu(185)
        .run(connections, &address, &CancellationToken::new())
        .await;

    assert_matches!(
        result,
        Err(PipelineError::Step {
            index: 1,
            source: BleError::PlatformOperationFailed { status: Some(0x0a), .. },
            ..
        })
    );
    assert_eq!(None, connections.peripheral(&address).and_then(|p| p.mtu()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_setup_pipeline_reports_completed_steps() -> anyhow::Result<()> {
    let (_platform, central) = central(
        FakePlatformConfig::builder()
            .devices(devices())
            .unresponsive(HashSet::from([battery_level()]))
            .build(),
    );
    let address = PeripheralAddress::from(ADDRESS);
    let connections = central.connections();
    let (_peripheral, _link) = connections.connect_async(&address).await?;
    let cancel = CancellationToken::new();

    let pipeline = SetupPipeline::new()
        .request_mtu(185)
        .read(battery_level())
        .read(battery_level());
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let result = pipeline.run(connections, &address, &cancel).await;

    assert_eq!(Err(PipelineError::Cancelled { completed: 1 }), result);
    Ok(())
}
