use std::path::Path;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SCAN_THROTTLE_MAX_STARTS: usize = 5;
const DEFAULT_SCAN_THROTTLE_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_OUT_OF_RANGE_PERIOD: Duration = Duration::from_millis(500);
const DEFAULT_L2CAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Scan-start throttle: at most `max_starts` platform starts per `window`.
///
/// A `max_starts` of zero disables throttling.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder, Deserialize)]
#[serde(default)]
pub struct ScanThrottlePolicy {
    #[builder(default = DEFAULT_SCAN_THROTTLE_MAX_STARTS)]
    pub max_starts: usize,
    #[builder(default = DEFAULT_SCAN_THROTTLE_WINDOW)]
    #[serde(rename = "window_ms", deserialize_with = "millis")]
    pub window: Duration,
}

impl Default for ScanThrottlePolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScanThrottlePolicy {
    #[must_use]
    pub fn unlimited() -> Self {
        Self::builder().max_starts(0).build()
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_starts == 0
    }
}

/// What the scanner does with a start request that hits the throttle.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottledStartBehaviour {
    /// Schedule the start for when the window allows it and report the delay.
    #[default]
    Defer,
    /// End the scan session with a rate-limit error.
    Reject,
}

/// Defaults for L2CAP command exchanges.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder, Deserialize)]
#[serde(default)]
pub struct L2capDefaults {
    #[builder(default = DEFAULT_L2CAP_TIMEOUT)]
    #[serde(rename = "write_timeout_ms", deserialize_with = "millis")]
    pub write_timeout: Duration,
    #[builder(default = DEFAULT_L2CAP_TIMEOUT)]
    #[serde(rename = "read_timeout_ms", deserialize_with = "millis")]
    pub read_timeout: Duration,
    #[builder(default)]
    pub retry_count: u32,
}

impl Default for L2capDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Tunables for the connection manager and scanner.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    #[serde(rename = "disconnect_timeout_ms", deserialize_with = "millis")]
    pub disconnect_timeout: Duration,
    /// Watchdog applied to every GATT operation.
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    #[serde(rename = "operation_timeout_ms", deserialize_with = "millis")]
    pub operation_timeout: Duration,
    #[builder(default)]
    pub scan_throttle: ScanThrottlePolicy,
    #[builder(default)]
    pub throttled_start: ThrottledStartBehaviour,
    #[builder(default = DEFAULT_OUT_OF_RANGE_PERIOD)]
    #[serde(rename = "out_of_range_period_ms", deserialize_with = "millis")]
    pub out_of_range_period: Duration,
    #[builder(default)]
    pub l2cap: L2capDefaults,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CentralConfig {
    /// Loads a configuration from a JSON file. Missing fields keep defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
