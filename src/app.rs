use std::io;
use std::sync::Arc;

use anyhow::Result;
use bon::Builder;
use tracing::instrument;

use crate::central::Central;
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::config::CentralConfig;
use crate::hw::{BlePlatform, BtleplugPlatform, FakePlatform};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates a platform backed by the first local Bluetooth adapter.
///
/// # Errors
///
/// Returns an error if no adapter is available.
pub async fn real_platform() -> Result<Arc<dyn BlePlatform>> {
    Ok(Arc::new(BtleplugPlatform::new().await?))
}

/// Creates a platform backed by fake scan fixtures.
#[must_use]
pub fn fake_platform(fake_args: FakeArgs) -> Arc<dyn BlePlatform> {
    Arc::new(FakePlatform::new(fake_args.into_platform_config()))
}

/// Settings that apply to a whole CLI run rather than one command.
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct RunOptions {
    log_level: Option<LogLevel>,
    /// Defaults to pretty on a terminal and JSON otherwise.
    output_format: Option<OutputFormat>,
    #[builder(default)]
    config: CentralConfig,
}

/// Runs the CLI command against `platform` with default options.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = uubluetooth::Args::try_parse_from([
///     "uubluetooth",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC:DD:EE:01|UU-Sensor|-43",
///     "scan",
///     "--duration",
///     "200ms",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let platform = match maybe_fake_args {
///     Some(fake_args) => uubluetooth::fake_platform(fake_args),
///     None => uubluetooth::real_platform().await?,
/// };
/// let mut out = Vec::new();
/// uubluetooth::run(command, &mut out, platform).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<W>(command: Command, out: &mut W, platform: Arc<dyn BlePlatform>) -> Result<()>
where
    W: io::Write,
{
    run_with_options(command, out, platform, RunOptions::default()).await
}

/// Runs the CLI command with explicit run options.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = uubluetooth::Args::try_parse_from([
///     "uubluetooth",
///     "--log-level",
///     "debug",
///     "--output",
///     "json",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC:DD:EE:01|UU-Sensor|-43",
///     "inspect",
///     "AA:BB:CC:DD:EE:01",
/// ])?;
/// let options = uubluetooth::RunOptions::builder()
///     .maybe_log_level(args.log_level())
///     .maybe_output_format(args.output_format())
///     .config(args.central_config()?)
///     .build();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let platform = match maybe_fake_args {
///     Some(fake_args) => uubluetooth::fake_platform(fake_args),
///     None => uubluetooth::real_platform().await?,
/// };
/// let mut out = Vec::new();
/// uubluetooth::run_with_options(command, &mut out, platform, options).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run_with_options<W>(
    command: Command,
    out: &mut W,
    platform: Arc<dyn BlePlatform>,
    options: RunOptions,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(command, out, &SystemTerminalClient, platform, options).await
}

/// Runs the CLI command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(out, terminal_client, platform, options),
    level = "info",
    fields(command = %command.name(), log_level = ?options.log_level)
)]
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    platform: Arc<dyn BlePlatform>,
    options: RunOptions,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "uubluetooth",
        terminal_client.stderr_is_terminal(),
        options.log_level.map(LogLevel::as_level_filter),
    )?;

    let stdout_is_terminal = terminal_client.stdout_is_terminal();
    let output_format = options.output_format.unwrap_or(if stdout_is_terminal {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });
    let central = Central::new(platform, options.config);

    match command {
        Command::Scan(args) => {
            crate::cli::scan::run(&central, &args, out, output_format, stdout_is_terminal).await
        }
        Command::Inspect(args) => {
            crate::cli::inspect::run(&central, &args, out, output_format, stdout_is_terminal)
                .await
        }
        Command::Read(args) => crate::cli::read::run(&central, &args, out, output_format).await,
        Command::L2capEcho(args) => {
            crate::cli::l2cap_echo::run(&central, &args, out, output_format).await
        }
    }
}
