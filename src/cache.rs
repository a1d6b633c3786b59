use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Advertisement, Peripheral, PeripheralAddress};

/// Shared store of canonical peripheral records, one per address.
///
/// Records are handed out as `Arc` snapshots; every update replaces the
/// snapshot so earlier readers keep a consistent view. Each `Central` owns its
/// own cache, so tests never share state through it.
#[derive(Debug, Default)]
pub struct PeripheralCache {
    peripherals: Mutex<HashMap<PeripheralAddress, Arc<Peripheral>>>,
}

impl PeripheralCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot for an address.
    #[must_use]
    pub fn get(&self, address: &PeripheralAddress) -> Option<Arc<Peripheral>> {
        self.peripherals.lock().get(address).cloned()
    }

    /// Records a new advertisement, creating the peripheral on first sight.
    pub fn observe(&self, advertisement: Advertisement) -> Arc<Peripheral> {
        let address = advertisement.address().clone();
        self.update(&address, |peripheral| peripheral.observe(advertisement))
    }

    /// Applies `apply` to the record for `address` and stores the result.
    pub fn update<F>(&self, address: &PeripheralAddress, apply: F) -> Arc<Peripheral>
    where
        F: FnOnce(&mut Peripheral),
    {
        let mut peripherals = self.peripherals.lock();
        let mut peripheral = peripherals
            .get(address)
            .map_or_else(|| Peripheral::new(address.clone()), |existing| (**existing).clone());
        apply(&mut peripheral);
        let snapshot = Arc::new(peripheral);
        peripherals.insert(address.clone(), Arc::clone(&snapshot));
        snapshot
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peripherals.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peripherals.lock().is_empty()
    }

    /// Returns every cached snapshot ordered by address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Peripheral>> {
        let mut peripherals: Vec<_> = self.peripherals.lock().values().cloned().collect();
        peripherals.sort_by(|left, right| left.address().cmp(right.address()));
        peripherals
    }
}
