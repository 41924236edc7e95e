//! Exit-node geolocation from a local MMDB database
//!
//! Lookups are pure reads against an offline GeoLite2-City database
//! and never fail: a host the database does not know (or that is not
//! an IP at all) yields the all-unknown record.

use crate::proxy::models::GeoRecord;
use crate::Result;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Lookup seam used by the aggregator; implementations must be
/// infallible and safe for concurrent reads
pub trait GeoLookup {
    fn lookup(&self, host: &str) -> GeoRecord;
}

/// Locator backed by an MMDB file
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Open an MMDB file (e.g. GeoLite2-City.mmdb)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    fn lookup_ip(&self, ip: IpAddr) -> Option<GeoRecord> {
        let lookup_result = self.reader.lookup(ip).ok()?;
        let city: Option<geoip2::City> = lookup_result.decode().ok()?;
        let city = city?;

        // Country name, falling back to the continent when the database
        // only resolves that far
        let country = city
            .country
            .names
            .english
            .map(String::from)
            .or_else(|| city.continent.names.english.map(String::from));

        let region = city
            .subdivisions
            .into_iter()
            .next()
            .and_then(|subdivision| subdivision.names.english.map(String::from));

        let city_name = city.city.names.english.map(String::from);

        Some(GeoRecord {
            country,
            region,
            city: city_name,
        })
    }
}

impl GeoLookup for GeoLocator {
    fn lookup(&self, host: &str) -> GeoRecord {
        let Ok(ip) = host.parse::<IpAddr>() else {
            return GeoRecord::unknown();
        };
        self.lookup_ip(ip).unwrap_or_else(GeoRecord::unknown)
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Table-backed lookup for tests
#[cfg(test)]
impl GeoLookup for std::collections::HashMap<String, GeoRecord> {
    fn lookup(&self, host: &str) -> GeoRecord {
        self.get(host).cloned().unwrap_or_else(GeoRecord::unknown)
    }
}
