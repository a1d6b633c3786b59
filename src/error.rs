use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::l2cap::L2capCodecError;
use crate::model::PeripheralAddress;

/// Errors delivered through connection, GATT, scanner and L2CAP completions.
///
/// The type is `Clone` because one failure (for example a dropped link) may
/// have to complete several pending operations at once.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum BleError {
    #[error("a connection to `{address}` is already established or in progress")]
    AlreadyConnected { address: PeripheralAddress },
    #[error("device `{address}` is not known to the platform device registry")]
    PreconditionFailed { address: PeripheralAddress },
    #[error("permission `{permission}` has not been granted")]
    InsufficientPermissions { permission: String },
    #[error("`{operation}` timed out after {}", humantime::format_duration(*timeout))]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("platform operation `{operation}` failed: {reason}")]
    PlatformOperationFailed {
        operation: String,
        status: Option<i32>,
        reason: String,
    },
    #[error("failed to decode L2CAP frame")]
    ProtocolDecodeFailed(#[from] L2capCodecError),
    #[error("scan start was rate limited; retry in {}", humantime::format_duration(*retry_after))]
    RateLimited { retry_after: Duration },
    #[error("device `{address}` is not connected")]
    NotConnected { address: PeripheralAddress },
    #[error("operation `{key}` is already in progress")]
    OperationInProgress { key: String },
}

impl BleError {
    /// Wraps a platform failure whose only detail is its message.
    pub(crate) fn platform(operation: impl Into<String>, reason: impl Display) -> Self {
        Self::PlatformOperationFailed {
            operation: operation.into(),
            status: None,
            reason: reason.to_string(),
        }
    }

    /// Wraps a platform failure that carries a numeric status code.
    pub(crate) fn platform_status(operation: impl Into<String>, status: i32) -> Self {
        Self::PlatformOperationFailed {
            operation: operation.into(),
            status: Some(status),
            reason: format!("status {status}"),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns whether this error came from a fired watchdog.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<btleplug::Error> for BleError {
    fn from(error: btleplug::Error) -> Self {
        Self::platform("btleplug", error)
    }
}

/// Errors returned when parsing fake platform fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three or four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain an empty address")]
    EmptyAddress,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("fixture payload is not valid hexadecimal")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned while loading a central configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{path}`")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration file `{path}` is not valid JSON")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
