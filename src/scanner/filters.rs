use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::Peripheral;

/// Decision taken for one advertisement.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InclusionVerdict {
    Accept,
    /// Drop this advertisement only.
    IgnoreOnce,
    /// Drop this peripheral until the next scan start.
    IgnoreForever,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RangeVerdict {
    InRange,
    OutOfRange,
}

/// Decides whether an advertising peripheral joins the nearby list.
///
/// Evaluated without the scanner lock held, so a filter may query the
/// [`Scanner`](super::Scanner).
pub trait InclusionFilter: Send + Sync {
    fn evaluate(&self, peripheral: &Peripheral) -> InclusionVerdict;
}

impl<F> InclusionFilter for F
where
    F: Fn(&Peripheral) -> InclusionVerdict + Send + Sync,
{
    fn evaluate(&self, peripheral: &Peripheral) -> InclusionVerdict {
        self(peripheral)
    }
}

/// Decides whether a nearby peripheral should be evicted. Runs without the
/// scanner lock held.
pub trait OutOfRangeFilter: Send + Sync {
    fn evaluate(&self, peripheral: &Peripheral, now: Instant) -> RangeVerdict;
}

impl<F> OutOfRangeFilter for F
where
    F: Fn(&Peripheral, Instant) -> RangeVerdict + Send + Sync,
{
    fn evaluate(&self, peripheral: &Peripheral, now: Instant) -> RangeVerdict {
        self(peripheral, now)
    }
}

/// Ignores advertisements weaker than `min_rssi`, once per advertisement.
#[derive(Debug, Clone, Copy)]
pub struct MinimumRssiFilter {
    pub min_rssi: i16,
}

impl InclusionFilter for MinimumRssiFilter {
    fn evaluate(&self, peripheral: &Peripheral) -> InclusionVerdict {
        match peripheral.rssi() {
            Some(rssi) if rssi >= self.min_rssi => InclusionVerdict::Accept,
            _ => InclusionVerdict::IgnoreOnce,
        }
    }
}

/// Permanently ignores peripherals whose name does not start with `prefix`.
///
/// Unnamed peripherals are ignored once, since a later advertisement may
/// carry the name.
#[derive(Debug, Clone)]
pub struct NamePrefixFilter {
    pub prefix: String,
}

impl InclusionFilter for NamePrefixFilter {
    fn evaluate(&self, peripheral: &Peripheral) -> InclusionVerdict {
        match peripheral.name() {
            Some(name) if name.starts_with(&self.prefix) => InclusionVerdict::Accept,
            Some(_) => InclusionVerdict::IgnoreForever,
            None => InclusionVerdict::IgnoreOnce,
        }
    }
}

/// Accepts peripherals advertising `service_uuid`.
#[derive(Debug, Clone)]
pub struct ServiceUuidFilter {
    pub service_uuid: String,
}

impl InclusionFilter for ServiceUuidFilter {
    fn evaluate(&self, peripheral: &Peripheral) -> InclusionVerdict {
        let advertised = peripheral.advertisement().is_some_and(|advertisement| {
            advertisement
                .service_uuids()
                .iter()
                .any(|uuid| uuid.eq_ignore_ascii_case(&self.service_uuid))
        });
        if advertised {
            InclusionVerdict::Accept
        } else {
            InclusionVerdict::IgnoreOnce
        }
    }
}

/// Evicts peripherals not heard from within `max_age`.
#[derive(Debug, Clone, Copy)]
pub struct StaleAdvertisementFilter {
    pub max_age: Duration,
}

impl OutOfRangeFilter for StaleAdvertisementFilter {
    fn evaluate(&self, peripheral: &Peripheral, now: Instant) -> RangeVerdict {
        match peripheral.time_since_last_seen(now) {
            Some(age) if age <= self.max_age => RangeVerdict::InRange,
            _ => RangeVerdict::OutOfRange,
        }
    }
}
