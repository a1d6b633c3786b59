//! Advertisement scanning with inclusion filters, out-of-range eviction and
//! scan-start throttling.

mod engine;
mod filters;
mod throttle;

pub use self::engine::{ScanEvent, ScanObserver, ScanSettings, Scanner};
pub use self::filters::{
    InclusionFilter, InclusionVerdict, MinimumRssiFilter, NamePrefixFilter, OutOfRangeFilter,
    RangeVerdict, ServiceUuidFilter, StaleAdvertisementFilter,
};
