use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::manager::ConnectionManager;
use crate::error::BleError;
use crate::gatt::Handler;
use crate::model::{PeripheralAddress, WriteType};

/// One step of a post-connect setup sequence.
#[derive(Clone)]
pub enum SetupStep {
    Read {
        characteristic: String,
    },
    Write {
        characteristic: String,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: String,
        enabled: bool,
        on_data_changed: Option<Handler<Vec<u8>>>,
    },
    RequestMtu {
        mtu: u16,
    },
}

impl fmt::Debug for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { characteristic } => write!(f, "read {characteristic}"),
            Self::Write {
                characteristic,
                value,
                write_type,
            } => write!(
                f,
                "write {} bytes to {characteristic} ({write_type})",
                value.len()
            ),
            Self::SetNotify {
                characteristic,
                enabled,
                ..
            } => write!(f, "set notify {enabled} on {characteristic}"),
            Self::RequestMtu { mtu } => write!(f, "request mtu {mtu}"),
        }
    }
}

/// Result of one completed step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepOutcome {
    Read(Vec<u8>),
    Written,
    NotifySet(bool),
    Mtu(u16),
}

/// Errors returned by [`SetupPipeline::run`].
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PipelineError {
    #[error("setup step {index} ({step}) failed")]
    Step {
        index: usize,
        step: String,
        #[source]
        source: BleError,
    },
    #[error("setup cancelled after {completed} steps")]
    Cancelled { completed: usize },
}

/// Ordered setup steps run one at a time against a connected peripheral.
///
/// Each step starts only after the previous one completed; the first failure
/// or a cancellation stops the run.
#[derive(Debug, Clone, Default)]
pub struct SetupPipeline {
    steps: Vec<SetupStep>,
}

impl SetupPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: SetupStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn read(self, characteristic: impl Into<String>) -> Self {
        self.step(SetupStep::Read {
            characteristic: characteristic.into(),
        })
    }

    #[must_use]
    pub fn write(
        self,
        characteristic: impl Into<String>,
        value: impl Into<Vec<u8>>,
        write_type: WriteType,
    ) -> Self {
        self.step(SetupStep::Write {
            characteristic: characteristic.into(),
            value: value.into(),
            write_type,
        })
    }

    #[must_use]
    pub fn subscribe(
        self,
        characteristic: impl Into<String>,
        on_data_changed: Handler<Vec<u8>>,
    ) -> Self {
        self.step(SetupStep::SetNotify {
            characteristic: characteristic.into(),
            enabled: true,
            on_data_changed: Some(on_data_changed),
        })
    }

    #[must_use]
    pub fn request_mtu(self, mtu: u16) -> Self {
        self.step(SetupStep::RequestMtu { mtu })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first failing step, or [`PipelineError::Cancelled`] once
    /// `cancel` fires.
    #[instrument(
        skip(self, manager, cancel),
        level = "debug",
        fields(%address, steps = self.steps.len())
    )]
    pub async fn run(
        &self,
        manager: &ConnectionManager,
        address: &PeripheralAddress,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(PipelineError::Cancelled { completed: index });
                }
                outcome = run_step(manager, address, step) => outcome,
            };
            let outcome = outcome.map_err(|source| PipelineError::Step {
                index,
                step: step.to_string(),
                source,
            })?;
            debug!(index, %step, "setup step complete");
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

async fn run_step(
    manager: &ConnectionManager,
    address: &PeripheralAddress,
    step: &SetupStep,
) -> Result<StepOutcome, BleError> {
    match step {
        SetupStep::Read { characteristic } => manager
            .read_characteristic_async(address, characteristic)
            .await
            .map(StepOutcome::Read),
        SetupStep::Write {
            characteristic,
            value,
            write_type,
        } => manager
            .write_characteristic_async(address, characteristic, value.clone(), *write_type)
            .await
            .map(|()| StepOutcome::Written),
        SetupStep::SetNotify {
            characteristic,
            enabled,
            on_data_changed,
        } => manager
            .set_notify_async(address, characteristic, *enabled, on_data_changed.clone())
            .await
            .map(StepOutcome::NotifySet),
        SetupStep::RequestMtu { mtu } => manager
            .request_mtu_async(address, *mtu)
            .await
            .map(StepOutcome::Mtu),
    }
}
