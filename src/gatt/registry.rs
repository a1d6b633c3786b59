use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::error::BleError;
use crate::model::{PeripheralAddress, PhyPair, ServiceInfo};

/// Single-shot completion of one GATT operation.
pub type Completion<T> = Box<dyn FnOnce(Result<T, BleError>) + Send>;

/// Persistent handler invoked for every matching event.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A kind of single-shot GATT operation and the value it completes with.
pub trait OperationFamily {
    type Output: Send + 'static;

    /// Operation label used in keys, timer ids and logs.
    const OPERATION: &'static str;

    #[doc(hidden)]
    fn slot(pending: &mut PendingCallbacks) -> &mut HashMap<String, Completion<Self::Output>>;
}

macro_rules! operation_families {
    ($($(#[$meta:meta])* $family:ident => $field:ident: $output:ty, $operation:literal;)+) => {
        /// Every outstanding single-shot completion, grouped by family.
        #[derive(Default)]
        pub struct PendingCallbacks {
            $($field: HashMap<String, Completion<$output>>,)+
        }

        impl PendingCallbacks {
            #[must_use]
            pub fn len(&self) -> usize {
                0 $(+ self.$field.len())+
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Completes every callback with a clone of `error`.
            pub fn fail_with(self, error: &BleError) {
                $(
                    for (_, completion) in self.$field {
                        completion(Err(error.clone()));
                    }
                )+
            }
        }

        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub enum $family {}

            impl OperationFamily for $family {
                type Output = $output;
                const OPERATION: &'static str = $operation;

                fn slot(
                    pending: &mut PendingCallbacks,
                ) -> &mut HashMap<String, Completion<$output>> {
                    &mut pending.$field
                }
            }
        )+
    };
}

operation_families! {
    /// Characteristic read, keyed by characteristic UUID.
    ReadCharacteristic => read_characteristic: Vec<u8>, "ReadCharacteristic";
    WriteCharacteristic => write_characteristic: (), "WriteCharacteristic";
    /// Descriptor read, keyed by characteristic and descriptor UUID.
    ReadDescriptor => read_descriptor: Vec<u8>, "ReadDescriptor";
    WriteDescriptor => write_descriptor: (), "WriteDescriptor";
    /// Notification enable/disable; completes with the new state.
    SetNotify => set_notify: bool, "SetNotify";
    DiscoverServices => discover_services: Vec<ServiceInfo>, "DiscoverServices";
    ReadRssi => read_rssi: i16, "ReadRssi";
    RequestMtu => request_mtu: u16, "RequestMtu";
    ReadPhy => read_phy: PhyPair, "ReadPhy";
    SetPreferredPhy => set_preferred_phy: PhyPair, "SetPreferredPhy";
    ExecuteReliableWrite => execute_reliable_write: (), "ExecuteReliableWrite";
}

impl fmt::Debug for PendingCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCallbacks")
            .field("len", &self.len())
            .finish()
    }
}

/// Builds the key shared by a pending operation and its watchdog timer.
#[must_use]
pub fn operation_key(address: &PeripheralAddress, operation: &str, uuid: Option<&str>) -> String {
    match uuid {
        Some(uuid) => format!("{address}__{operation}__{}", uuid.to_ascii_lowercase()),
        None => format!("{address}__{operation}"),
    }
}

#[derive(Default)]
struct RegistryState {
    pending: PendingCallbacks,
    connection_state_changed: Option<Handler<ConnectionState>>,
    service_changed: Option<Handler<()>>,
    data_changed: HashMap<String, Handler<Vec<u8>>>,
}

/// Fans platform results out to keyed single-shot completions.
///
/// All state sits behind one mutex so a `notify` racing a `register` for the
/// same key either sees the registration or does not. Callbacks always run
/// after the lock is released.
#[derive(Default)]
pub struct GattCallbackRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for GattCallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GattCallbackRegistry")
            .field("pending", &state.pending)
            .field("data_changed", &state.data_changed.len())
            .finish_non_exhaustive()
    }
}

impl GattCallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a completion under `key`.
    ///
    /// # Errors
    ///
    /// Hands the completion back untouched when `key` is already in use.
    pub fn register<F: OperationFamily>(
        &self,
        key: impl Into<String>,
        completion: Completion<F::Output>,
    ) -> Result<(), Completion<F::Output>> {
        let mut state = self.state.lock();
        match F::slot(&mut state.pending).entry(key.into()) {
            Entry::Occupied(_) => Err(completion),
            Entry::Vacant(vacant) => {
                vacant.insert(completion);
                Ok(())
            }
        }
    }

    /// Removes and returns the completion for `key`.
    pub fn take<F: OperationFamily>(&self, key: &str) -> Option<Completion<F::Output>> {
        F::slot(&mut self.state.lock().pending).remove(key)
    }

    #[must_use]
    pub fn is_pending<F: OperationFamily>(&self, key: &str) -> bool {
        F::slot(&mut self.state.lock().pending).contains_key(key)
    }

    /// Completes and removes the callback for `key`. Unknown keys are a no-op.
    pub fn notify<F: OperationFamily>(
        &self,
        key: &str,
        result: Result<F::Output, BleError>,
    ) -> bool {
        match self.take::<F>(key) {
            Some(completion) => {
                completion(result);
                true
            }
            None => {
                trace!(key, operation = F::OPERATION, "no pending callback for result");
                false
            }
        }
    }

    pub fn set_connection_state_handler(&self, handler: Option<Handler<ConnectionState>>) {
        self.state.lock().connection_state_changed = handler;
    }

    pub fn notify_connection_state_changed(&self, state: ConnectionState) -> bool {
        let handler = self.state.lock().connection_state_changed.clone();
        handler.map(|handler| handler(state)).is_some()
    }

    pub fn set_service_changed_handler(&self, handler: Option<Handler<()>>) {
        self.state.lock().service_changed = handler;
    }

    pub fn notify_service_changed(&self) -> bool {
        let handler = self.state.lock().service_changed.clone();
        handler.map(|handler| handler(())).is_some()
    }

    /// Installs the notification handler for a characteristic key.
    pub fn set_data_changed_handler(&self, key: impl Into<String>, handler: Handler<Vec<u8>>) {
        self.state.lock().data_changed.insert(key.into(), handler);
    }

    pub fn remove_data_changed_handler(&self, key: &str) -> bool {
        self.state.lock().data_changed.remove(key).is_some()
    }

    pub fn notify_data_changed(&self, key: &str, value: Vec<u8>) -> bool {
        let handler = self.state.lock().data_changed.get(key).cloned();
        match handler {
            Some(handler) => {
                handler(value);
                true
            }
            None => {
                trace!(key, "no data-changed handler for notification");
                false
            }
        }
    }

    /// Drops every callback and handler without invoking any of them.
    pub fn clear_all(&self) {
        let cleared = std::mem::take(&mut *self.state.lock());
        drop(cleared);
    }

    /// Detaches every pending single-shot completion, keeping handlers.
    pub fn take_all_pending(&self) -> PendingCallbacks {
        std::mem::take(&mut self.state.lock().pending)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::Phy;

    fn counting<T: Send + 'static>(count: &Arc<AtomicUsize>) -> Completion<T> {
        let count = Arc::clone(count);
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn counting_handler<T: 'static>(count: &Arc<AtomicUsize>) -> Handler<T> {
        let count = Arc::clone(count);
        Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn notify_completes_once_and_removes_the_entry() {
        let registry = GattCallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .register::<ReadCharacteristic>(
                "key",
                Box::new(move |result: Result<Vec<u8>, BleError>| sink.lock().push(result)),
            )
            .map_err(|_| "key in use")
            .expect("first registration succeeds");

        assert!(registry.notify::<ReadCharacteristic>("key", Ok(vec![1, 2])));
        assert!(!registry.notify::<ReadCharacteristic>("key", Ok(vec![3])));

        assert_eq!(vec![Ok(vec![1, 2])], *seen.lock());
    }

    #[test]
    fn second_registration_for_key_is_handed_back() {
        let registry = GattCallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        assert!(matches!(registry.register::<WriteCharacteristic>("key", counting(&count)), Ok(())));
        let rejected = registry.register::<WriteCharacteristic>("key", counting(&count));

        assert!(matches!(rejected, Err(_)));
        assert!(registry.is_pending::<WriteCharacteristic>("key"));
        assert!(matches!(registry.register::<ReadCharacteristic>("key", counting(&count)), Ok(())));
    }

    #[test]
    fn clear_all_silences_every_callback_kind() {
        let registry = GattCallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let phy = PhyPair {
            tx: Phy::Le2M,
            rx: Phy::Le2M,
        };

        let registrations = [
            registry.register::<ReadCharacteristic>("k", counting(&count)).is_ok(),
            registry.register::<WriteCharacteristic>("k", counting(&count)).is_ok(),
            registry.register::<ReadDescriptor>("k", counting(&count)).is_ok(),
            registry.register::<WriteDescriptor>("k", counting(&count)).is_ok(),
            registry.register::<SetNotify>("k", counting(&count)).is_ok(),
            registry.register::<DiscoverServices>("k", counting(&count)).is_ok(),
            registry.register::<ReadRssi>("k", counting(&count)).is_ok(),
            registry.register::<RequestMtu>("k", counting(&count)).is_ok(),
            registry.register::<ReadPhy>("k", counting(&count)).is_ok(),
            registry.register::<SetPreferredPhy>("k", counting(&count)).is_ok(),
            registry.register::<ExecuteReliableWrite>("k", counting(&count)).is_ok(),
        ];
        assert!(registrations.iter().all(|registered| *registered));
        registry.set_connection_state_handler(Some(counting_handler(&count)));
        registry.set_service_changed_handler(Some(counting_handler(&count)));
        registry.set_data_changed_handler("k", counting_handler(&count));

        registry.clear_all();

        let delivered = [
            registry.notify::<ReadCharacteristic>("k", Ok(Vec::new())),
            registry.notify::<WriteCharacteristic>("k", Ok(())),
            registry.notify::<ReadDescriptor>("k", Ok(Vec::new())),
            registry.notify::<WriteDescriptor>("k", Ok(())),
            registry.notify::<SetNotify>("k", Ok(true)),
            registry.notify::<DiscoverServices>("k", Ok(Vec::new())),
            registry.notify::<ReadRssi>("k", Ok(-40)),
            registry.notify::<RequestMtu>("k", Ok(247)),
            registry.notify::<ReadPhy>("k", Ok(phy)),
            registry.notify::<SetPreferredPhy>("k", Ok(phy)),
            registry.notify::<ExecuteReliableWrite>("k", Ok(())),
            registry.notify_connection_state_changed(ConnectionState::Connected),
            registry.notify_service_changed(),
            registry.notify_data_changed("k", vec![1]),
        ];

        assert!(delivered.iter().all(|delivered| !*delivered));
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn take_all_pending_fails_callbacks_and_keeps_handlers() {
        let registry = GattCallbackRegistry::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handler_count = Arc::new(AtomicUsize::new(0));
        let address = PeripheralAddress::from("AA:BB");
        let _ = registry.register::<ReadRssi>(
            "rssi",
            Box::new(move |result: Result<i16, BleError>| sink.lock().push(result)),
        );
        registry.set_data_changed_handler("k", counting_handler(&handler_count));

        let pending = registry.take_all_pending();
        assert_eq!(1, pending.len());
        pending.fail_with(&BleError::NotConnected {
            address: address.clone(),
        });

        assert_eq!(vec![Err(BleError::NotConnected { address })], *errors.lock());
        assert!(registry.notify_data_changed("k", Vec::new()));
        assert_eq!(1, handler_count.load(Ordering::SeqCst));
    }

    #[test]
    fn operation_key_lowercases_uuid() {
        let address = PeripheralAddress::from("AA:BB");

        assert_eq!(
            "AA:BB__ReadCharacteristic__00002a19",
            operation_key(&address, ReadCharacteristic::OPERATION, Some("00002A19"))
        );
        assert_eq!("AA:BB__ReadRssi", operation_key(&address, ReadRssi::OPERATION, None));
    }
}
