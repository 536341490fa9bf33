pub use lookup::{GeoIpLookup, LookupSettings, MmdbGeoIpLookup, CACHE_TAG};
pub use reader::{DatabaseOpener, GeoDatabase, MmdbDatabase, MmdbOpener, QueryOutcome};
pub use record::GeoRecord;

mod lookup;
mod reader;
mod record;
