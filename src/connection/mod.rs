//! Per-device connection lifecycle, GATT dispatch and setup pipelines.

mod manager;
mod pipeline;
mod state;

pub use self::manager::{
    ConnectedCallback, ConnectionManager, DisconnectSignal, DisconnectedCallback,
};
pub use self::pipeline::{PipelineError, SetupPipeline, SetupStep, StepOutcome};
pub use self::state::{ConnectionEvent, ConnectionState};
