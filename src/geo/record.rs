use serde::{Deserialize, Serialize};

/// Result of a successful geolocation lookup.
///
/// Partial population is expected: a country-only database fills the ip and
/// country fields and leaves everything else unset. That is not an error
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip_address: String,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub city: Option<String>,
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub postal_code: Option<String>,
}

impl GeoRecord {
    /// A record with only the ip filled in, used as the base for
    /// country-level results.
    pub fn empty(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            country_code: None,
            country_name: None,
            city: None,
            region_code: None,
            region_name: None,
            latitude: None,
            longitude: None,
            time_zone: None,
            postal_code: None,
        }
    }
}
