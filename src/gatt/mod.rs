//! Keyed single-shot callbacks for GATT operation results.

mod registry;

pub use self::registry::{
    Completion, DiscoverServices, ExecuteReliableWrite, GattCallbackRegistry, Handler,
    OperationFamily, PendingCallbacks, ReadCharacteristic, ReadDescriptor, ReadPhy, ReadRssi,
    RequestMtu, SetNotify, SetPreferredPhy, WriteCharacteristic, WriteDescriptor, operation_key,
};
