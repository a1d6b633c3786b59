use clap::Parser;
use clap::error::ErrorKind;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;

const FIXTURE: &str =
    "AA:BB:CC:DD:EE:01|UU-Sensor|-43;AA:BB:CC:DD:EE:02|Kettle|-71;AA:BB:CC:DD:EE:03|-|-58";

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl uubluetooth::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(
    args: uubluetooth::Args,
    output_format: uubluetooth::OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let options = uubluetooth::RunOptions::builder()
        .output_format(output_format)
        .config(args.central_config()?)
        .build();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let platform = match maybe_fake_args {
        Some(fake_args) => uubluetooth::fake_platform(fake_args),
        None => uubluetooth::real_platform().await?,
    };
    uubluetooth::run_with_clients(command, &mut output, &FakeTerminalClient, platform, options)
        .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = uubluetooth::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args, uubluetooth::OutputFormat::Pretty).await
}

fn fake_args() -> anyhow::Result<uubluetooth::FakeArgs> {
    Ok(uubluetooth::FakeArgs::builder().scan(FIXTURE)?.build())
}

#[tokio::test(start_paused = true)]
async fn scan_command_lists_fixture_devices_strongest_first() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "scan",
        "--duration",
        "1s",
    ])
    .await?;

    assert!(stdout.starts_with("3 nearby"), "{stdout}");
    let sensor = stdout.find("UU-Sensor").expect("sensor row");
    let unnamed = stdout.find("<unnamed>").expect("unnamed row");
    let kettle = stdout.find("Kettle").expect("kettle row");
    assert!(sensor < unnamed && unnamed < kettle, "{stdout}");
    assert!(stdout.contains("-43 dBm"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_applies_rssi_and_name_filters() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "scan",
        "--duration",
        "1s",
        "--min-rssi",
        "-60",
        "--name-prefix",
        "UU-",
    ])
    .await?;

    assert!(stdout.starts_with("1 nearby"), "{stdout}");
    assert!(stdout.contains("AA:BB:CC:DD:EE:01"));
    assert!(!stdout.contains("Kettle"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_writes_json_list() -> anyhow::Result<()> {
    let args = uubluetooth::Args::new(uubluetooth::Command::Scan(uubluetooth::ScanArgs::new(
        std::time::Duration::from_secs(1),
    )))
    .with_fake(fake_args()?);

    let stdout = run_with_parsed_args(args, uubluetooth::OutputFormat::Json).await?;
    let entries: serde_json::Value = serde_json::from_str(&stdout)?;

    let addresses = entries
        .as_array()
        .expect("scan output should be a JSON array")
        .iter()
        .map(|entry| entry["address"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        vec![
            "AA:BB:CC:DD:EE:01".to_string(),
            "AA:BB:CC:DD:EE:03".to_string(),
            "AA:BB:CC:DD:EE:02".to_string(),
        ],
        addresses
    );
    assert_eq!(serde_json::Value::Null, entries[1]["name"]);
    assert_eq!(-71, entries[2]["rssi"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn inspect_command_prints_gatt_tree_from_fake_peripheral() -> anyhow::Result<()> {
    let args = uubluetooth::Args::new(uubluetooth::Command::Inspect(uubluetooth::InspectArgs {
        target: uubluetooth::TargetArgs::new("AA:BB:CC:DD:EE:01"),
    }))
    .with_fake(fake_args()?);

    let stdout = run_with_parsed_args(args, uubluetooth::OutputFormat::Pretty).await?;

    assert!(stdout.starts_with("AA:BB:CC:DD:EE:01 UU-Sensor"), "{stdout}");
    assert!(stdout.contains("Generic Access"));
    assert!(stdout.contains("Battery Service"));
    assert!(stdout.contains("Battery Level"));
    assert!(stdout.contains("read, notify"));
    assert!(stdout.contains("Client Characteristic Configuration"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn inspect_command_writes_json_report() -> anyhow::Result<()> {
    let args = uubluetooth::Args::new(uubluetooth::Command::Inspect(uubluetooth::InspectArgs {
        target: uubluetooth::TargetArgs::new("AA:BB:CC:DD:EE:02"),
    }))
    .with_fake(fake_args()?);

    let stdout = run_with_parsed_args(args, uubluetooth::OutputFormat::Json).await?;
    let report: serde_json::Value = serde_json::from_str(&stdout)?;

    assert_eq!("AA:BB:CC:DD:EE:02", report["address"]);
    assert_eq!("Kettle", report["name"]);
    assert_eq!(
        2,
        report["services"].as_array().map_or(0, Vec::len),
        "{stdout}"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_command_resolves_known_characteristic_name() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "read",
        "AA:BB:CC:DD:EE:01",
        "battery_level",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @r#"
    Battery Level 57
    text "W"
    "#);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_command_accepts_short_uuid() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "read",
        "AA:BB:CC:DD:EE:03",
        "0x2A00",
    ])
    .await?;

    assert!(stdout.starts_with("Device Name "), "{stdout}");
    assert!(stdout.contains(r#"text "UU Fake""#));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_command_fails_for_device_that_never_advertises() {
    let result = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "read",
        "AA:BB:CC:DD:EE:09",
        "battery_level",
        "--discovery-timeout",
        "2s",
    ])
    .await;

    let error = result.expect_err("unknown device should not be found");
    assert!(
        error.to_string().contains("was not seen within 2s"),
        "{error:#}"
    );
}

#[tokio::test(start_paused = true)]
async fn l2cap_echo_command_prints_reply() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "uubluetooth",
        "--fake",
        "--fake-scan",
        FIXTURE,
        "l2cap-echo",
        "AA:BB:CC:DD:EE:01",
        "129",
        "hello",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @"echo hello");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn l2cap_echo_command_writes_json_report() -> anyhow::Result<()> {
    let args = uubluetooth::Args::new(uubluetooth::Command::L2capEcho(
        uubluetooth::L2capEchoArgs {
            address: "AA:BB:CC:DD:EE:02".to_string(),
            psm: 129,
            text: "hi".to_string(),
            secure: true,
            retries: Some(1),
        },
    ))
    .with_fake(fake_args()?);

    let stdout = run_with_parsed_args(args, uubluetooth::OutputFormat::Json).await?;
    let report: serde_json::Value = serde_json::from_str(&stdout)?;

    assert_eq!("echo", report["command"]);
    assert_eq!("6869", report["payload_hex"]);
    assert_eq!(129, report["psm"]);
    Ok(())
}

#[test]
fn fake_args_reject_invalid_fixture() {
    let result = uubluetooth::FakeArgs::builder().scan("invalid-record");
    assert!(matches!(
        result,
        Err(uubluetooth::FixtureError::InvalidRecordFieldCount)
    ));
}

#[test]
fn unknown_command_is_a_parse_error() {
    let result = uubluetooth::Args::try_parse_from(["uubluetooth", "pair"]);

    let error = result.expect_err("unknown subcommand should fail");
    assert_eq!(ErrorKind::InvalidSubcommand, error.kind());
}

#[test]
fn read_requires_characteristic() {
    let result = uubluetooth::Args::try_parse_from(["uubluetooth", "read", "AA:BB"]);

    let error = result.expect_err("missing characteristic should fail");
    assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
}
