use crate::geo::GeoRecord;

use maxminddb::{geoip2, MaxMindDBError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// Outcome of a single database query.
///
/// `Unsupported` means the open database edition cannot answer this query
/// shape at all (e.g. a city query against a country-only edition), as
/// opposed to `NotFound`, which means the edition could answer but has no
/// entry for the address.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Found(GeoRecord),
    NotFound,
    Unsupported,
    Failed(String),
}

/// One open handle to a binary geo database.
///
/// Queries on an open handle are safe for concurrent callers; the handle is
/// replaced, never mutated, when the underlying file path changes. Dropping
/// the handle releases its resources.
pub trait GeoDatabase: Send + Sync {
    fn query_city(&self, address: IpAddr) -> QueryOutcome;
    fn query_country(&self, address: IpAddr) -> QueryOutcome;
}

/// Opens database handles by path. The seam between the lookup layer and the
/// concrete reader library.
pub trait DatabaseOpener: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn GeoDatabase>>;
}

pub struct MmdbDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
    supports_city: bool,
}

impl MmdbDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MaxMindDBError> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        // Only City editions carry city-level records; the metadata names
        // the edition.
        let supports_city = reader.metadata.database_type.contains("City");
        Ok(Self {
            reader,
            supports_city,
        })
    }
}

impl GeoDatabase for MmdbDatabase {
    fn query_city(&self, address: IpAddr) -> QueryOutcome {
        if !self.supports_city {
            return QueryOutcome::Unsupported;
        }
        match self.reader.lookup::<geoip2::City>(address) {
            Ok(city) => QueryOutcome::Found(city_record(address, &city)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => QueryOutcome::NotFound,
            Err(error) => QueryOutcome::Failed(error.to_string()),
        }
    }

    fn query_country(&self, address: IpAddr) -> QueryOutcome {
        match self.reader.lookup::<geoip2::Country>(address) {
            Ok(country) => QueryOutcome::Found(country_record(address, &country)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => QueryOutcome::NotFound,
            Err(error) => QueryOutcome::Failed(error.to_string()),
        }
    }
}

fn english_name(names: &Option<BTreeMap<&str, &str>>) -> Option<String> {
    names
        .as_ref()
        .and_then(|names| names.get("en"))
        .map(|name| (*name).to_owned())
}

fn city_record(address: IpAddr, city: &geoip2::City) -> GeoRecord {
    // Subdivisions are ordered from least to most specific.
    let subdivision = city
        .subdivisions
        .as_ref()
        .and_then(|subdivisions| subdivisions.last());
    GeoRecord {
        country_code: city
            .country
            .as_ref()
            .and_then(|country| country.iso_code)
            .map(str::to_owned),
        country_name: city
            .country
            .as_ref()
            .and_then(|country| english_name(&country.names)),
        city: city.city.as_ref().and_then(|city| english_name(&city.names)),
        region_code: subdivision
            .and_then(|subdivision| subdivision.iso_code)
            .map(str::to_owned),
        region_name: subdivision.and_then(|subdivision| english_name(&subdivision.names)),
        latitude: city.location.as_ref().and_then(|location| location.latitude),
        longitude: city
            .location
            .as_ref()
            .and_then(|location| location.longitude),
        time_zone: city
            .location
            .as_ref()
            .and_then(|location| location.time_zone)
            .map(str::to_owned),
        postal_code: city
            .postal
            .as_ref()
            .and_then(|postal| postal.code)
            .map(str::to_owned),
        ..GeoRecord::empty(address.to_string())
    }
}

fn country_record(address: IpAddr, country: &geoip2::Country) -> GeoRecord {
    GeoRecord {
        country_code: country
            .country
            .as_ref()
            .and_then(|country| country.iso_code)
            .map(str::to_owned),
        country_name: country
            .country
            .as_ref()
            .and_then(|country| english_name(&country.names)),
        ..GeoRecord::empty(address.to_string())
    }
}

/// Default opener backed by `maxminddb`.
pub struct MmdbOpener;

impl DatabaseOpener for MmdbOpener {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn GeoDatabase>> {
        Ok(Box::new(MmdbDatabase::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fails_on_non_database_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not an mmdb").unwrap();
        assert!(MmdbDatabase::open(file.path()).is_err());
    }

    #[test]
    fn open_fails_on_missing_file() {
        assert!(MmdbDatabase::open("/nonexistent/GeoLite2-Country.mmdb").is_err());
    }
}
