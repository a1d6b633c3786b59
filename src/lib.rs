mod app;
mod cache;
mod central;
mod cli;
mod config;
mod connection;
mod error;
mod gatt;
mod hw;
mod l2cap;
mod model;
mod permissions;
mod protocol;
mod scanner;
mod telemetry;
mod terminal;
mod timer;
mod utils;

pub use app::{RunOptions, fake_platform, real_platform, run, run_with_clients, run_with_options};
pub use cache::PeripheralCache;
pub use central::Central;
pub use cli::{
    Args, Command, FakeArgs, InspectArgs, L2capEchoArgs, LogLevel, OutputFormat, ReadArgs,
    ScanArgs, TargetArgs,
};
pub use config::{CentralConfig, L2capDefaults, ScanThrottlePolicy, ThrottledStartBehaviour};
pub use connection::{
    ConnectedCallback, ConnectionEvent, ConnectionManager, ConnectionState, DisconnectSignal,
    DisconnectedCallback, PipelineError, SetupPipeline, SetupStep, StepOutcome,
};
pub use error::{BleError, ConfigError, FixtureError};
pub use gatt::{
    Completion, DiscoverServices, ExecuteReliableWrite, GattCallbackRegistry, Handler,
    OperationFamily, PendingCallbacks, ReadCharacteristic, ReadDescriptor, ReadPhy, ReadRssi,
    RequestMtu, SetNotify, SetPreferredPhy, WriteCharacteristic, WriteDescriptor, operation_key,
};
pub use hw::{
    BlePlatform, BtleplugPlatform, ConnectBehaviour, FakeDevice, FakePlatform, FakePlatformConfig,
    L2capIo, L2capStream, PlatformEvent,
};
pub use l2cap::{
    EchoCommandHandler, HEADER_LEN, L2capChannel, L2capCodecError, L2capCommand,
    L2capCommandHandler, L2capCommandId, L2capCommandServer, MAGIC, MAX_PAYLOAD_LEN,
};
pub use model::{
    Advertisement, CharacteristicInfo, DescriptorInfo, GattStatus, Peripheral, PeripheralAddress,
    Phy, PhyPair, ServiceInfo, WriteType,
};
pub use permissions::{
    AllPermissionsGranted, FixedPermissionStatus, Permission, PermissionChecker, PermissionStatus,
};
pub use protocol::{KnownAttribute, expand_short_uuid, known_uuid, resolve_uuid};
pub use scanner::{
    InclusionFilter, InclusionVerdict, MinimumRssiFilter, NamePrefixFilter, OutOfRangeFilter,
    RangeVerdict, ScanEvent, ScanObserver, ScanSettings, Scanner, ServiceUuidFilter,
    StaleAdvertisementFilter,
};
pub use terminal::TerminalClient;
pub use timer::TimerPool;
