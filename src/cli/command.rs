use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::config::CentralConfig;
use crate::error::{CliConfigError, ConfigError, FixtureError};
use crate::hw::{ConnectBehaviour, FakePlatformConfig, ScanFixture};

const DEFAULT_SCAN_DURATION: &str = "5s";
const DEFAULT_DISCOVERY_TIMEOUT: &str = "10s";

/// Command-line options for the UUBluetooth central tool.
#[derive(Debug, Parser)]
#[command(
    name = "uubluetooth",
    about = "Scan, inspect and exchange data with Bluetooth LE peripherals."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to pretty on a terminal and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// JSON file with central timeouts, throttle policy and L2CAP defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Uses the in-process fake platform instead of a Bluetooth adapter.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake devices in the form `address|name|rssi[|payload-hex];...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            config: None,
            fake: false,
            fake_scan: None,
            command,
        }
    }

    /// Enables fake platform mode with pre-parsed fixtures.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        self.fake = true;
        self.fake_scan = Some(fake.scan);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Loads the `--config` file, or the defaults when none was given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn central_config(&self) -> Result<CentralConfig, ConfigError> {
        self.config
            .as_deref()
            .map_or_else(|| Ok(CentralConfig::default()), CentralConfig::from_json_file)
    }

    /// Splits parsed arguments into the command and optional fake settings.
    ///
    /// # Errors
    ///
    /// Returns an error if fake mode is enabled without fixtures.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan,
                connect_behaviour: ConnectBehaviour::default(),
                response_delay: Duration::ZERO,
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake platform settings for programmatic runs.
#[derive(Debug, Clone, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> Result<_, FixtureError> { value.parse() })]
    scan: ScanFixture,
    #[builder(default)]
    connect_behaviour: ConnectBehaviour,
    #[builder(default)]
    response_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_platform_config(self) -> FakePlatformConfig {
        FakePlatformConfig::builder()
            .devices(self.scan.into())
            .connect_behaviour(self.connect_behaviour)
            .response_delay(self.response_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Scan for nearby peripherals and print them strongest first.
    Scan(ScanArgs),
    /// Connect to a peripheral and print its GATT service tree.
    Inspect(InspectArgs),
    /// Connect to a peripheral and read one characteristic.
    Read(ReadArgs),
    /// Open an L2CAP channel and round-trip an echo command.
    #[command(name = "l2cap-echo")]
    L2capEcho(L2capEchoArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Inspect(_) => "inspect",
            Self::Read(_) => "read",
            Self::L2capEcho(_) => "l2cap-echo",
        }
    }
}

#[derive(Debug, Clone, ClapArgs)]
pub struct ScanArgs {
    /// How long to scan (e.g. `500ms`, `5s`); Ctrl-C stops early.
    #[arg(long, default_value = DEFAULT_SCAN_DURATION, value_parser = parse_duration)]
    pub duration: Duration,
    /// Ignore advertisements weaker than this RSSI.
    #[arg(long, allow_negative_numbers = true)]
    pub min_rssi: Option<i16>,
    /// Only list peripherals whose name starts with this prefix.
    #[arg(long)]
    pub name_prefix: Option<String>,
}

impl ScanArgs {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            min_rssi: None,
            name_prefix: None,
        }
    }
}

/// Arguments shared by the commands that locate one peripheral first.
#[derive(Debug, Clone, ClapArgs)]
pub struct TargetArgs {
    /// Peripheral address as reported by `scan`.
    pub address: String,
    /// How long to scan for the peripheral before giving up.
    #[arg(long, default_value = DEFAULT_DISCOVERY_TIMEOUT, value_parser = parse_duration)]
    pub discovery_timeout: Duration,
}

impl TargetArgs {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, ClapArgs)]
pub struct InspectArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct ReadArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Characteristic UUID to read.
    pub characteristic: String,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct L2capEchoArgs {
    /// Peripheral address.
    pub address: String,
    /// Protocol/service multiplexer of the peer's channel.
    pub psm: u16,
    /// Text sent as the echo payload.
    pub text: String,
    /// Require an encrypted channel.
    #[arg(long)]
    pub secure: bool,
    /// Extra attempts after a timed-out exchange; defaults to the config value.
    #[arg(long)]
    pub retries: Option<u32>,
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fake_mode_requires_scan_fixture() {
        let result = Args::try_parse_from(["uubluetooth", "--fake", "scan"]);

        let error = result.expect_err("missing --fake-scan should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_scan_requires_fake_mode() {
        let result =
            Args::try_parse_from(["uubluetooth", "--fake-scan", "AA:BB|Clock|-43", "scan"]);

        let error = result.expect_err("--fake-scan should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn scan_accepts_negative_rssi_and_humantime_duration() {
        let args = Args::try_parse_from([
            "uubluetooth",
            "scan",
            "--duration",
            "750ms",
            "--min-rssi",
            "-70",
        ])
        .expect("scan arguments should parse");

        let (command, fake_args) = args
            .into_command_and_fake_args()
            .expect("real mode needs no fixtures");
        assert_matches!(fake_args, None);
        assert_matches!(
            command,
            Command::Scan(ScanArgs {
                duration,
                min_rssi: Some(-70),
                name_prefix: None,
            }) if duration == Duration::from_millis(750)
        );
    }

    #[test]
    fn l2cap_echo_parses_positionals() {
        let args = Args::try_parse_from([
            "uubluetooth",
            "--fake",
            "--fake-scan",
            "AA:BB|Clock|-43",
            "l2cap-echo",
            "AA:BB",
            "128",
            "hello",
        ])
        .expect("l2cap-echo arguments should parse");

        let (command, fake_args) = args
            .into_command_and_fake_args()
            .expect("fixtures are present");
        assert_matches!(fake_args, Some(_));
        assert_matches!(
            command,
            Command::L2capEcho(L2capEchoArgs { psm: 128, secure: false, .. })
        );
    }

    #[test]
    fn log_level_maps_to_filter() {
        let args = Args::try_parse_from(["uubluetooth", "--log-level", "debug", "scan"])
            .expect("log level should parse");
        assert_eq!(
            Some(LevelFilter::DEBUG),
            args.log_level().map(LogLevel::as_level_filter)
        );
    }
}
