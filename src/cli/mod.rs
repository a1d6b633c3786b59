pub(crate) mod command;
pub(crate) mod inspect;
pub(crate) mod l2cap_echo;
pub(crate) mod read;
pub(crate) mod scan;
mod target;
pub(crate) mod ui;

pub use self::command::{
    Args, Command, FakeArgs, InspectArgs, L2capEchoArgs, LogLevel, OutputFormat, ReadArgs,
    ScanArgs, TargetArgs,
};
