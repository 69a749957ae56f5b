//! Geolocation of client addresses from a MaxMind city database.

use std::{collections::HashMap, net::IpAddr, path::Path};

use log::{debug, warn};
use maxminddb::{MaxMindDBError, Reader, geoip2};
use snafu::prelude::*;

use crate::record::{EnrichedRecord, Location};

use super::{EnrichResult, LocationDbSnafu};

/// Error type returned by geolocation backends.
pub type LookupError = Box<dyn std::error::Error + Send + Sync>;

/// Maps an address to a location.
pub trait GeoLocator {
    /// Locate `address`. `Ok(None)` means the database has no entry for it.
    fn locate(&self, address: IpAddr) -> Result<Option<Location>, LookupError>;
}

/// Read-only GeoIP2/GeoLite2 city database.
pub struct CityDatabase {
    reader: Reader<Vec<u8>>,
}

impl CityDatabase {
    /// Open the `.mmdb` file at `path`.
    pub fn open(path: &Path) -> EnrichResult<Self> {
        let reader = Reader::open_readfile(path).context(LocationDbSnafu {
            path: path.display().to_string(),
        })?;
        debug!(
            "Opened location database {} ({})",
            path.display(),
            reader.metadata.database_type
        );
        Ok(Self { reader })
    }
}

impl GeoLocator for CityDatabase {
    fn locate(&self, address: IpAddr) -> Result<Option<Location>, LookupError> {
        let city = match self.reader.lookup::<geoip2::City>(address) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(None),
            Err(e) => return Err(Box::new(e)),
        };

        let (latitude, longitude) = match city.location.as_ref() {
            Some(loc) => match (loc.latitude, loc.longitude) {
                (Some(lat), Some(long)) => (Some(lat), Some(long)),
                _ => (None, None),
            },
            None => (None, None),
        };
        let name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .map(|name| name.to_string());
        let country = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(str::to_string);

        Ok(Some(Location {
            latitude,
            longitude,
            city: name,
            country,
        }))
    }
}

/// In-process cache in front of a [`GeoLocator`].
pub struct LocationCache {
    locator: Box<dyn GeoLocator + Send>,
    cache: HashMap<String, Option<Location>>,
}

impl LocationCache {
    /// Wrap `locator` with an empty cache.
    pub fn new(locator: Box<dyn GeoLocator + Send>) -> Self {
        Self {
            locator,
            cache: HashMap::new(),
        }
    }

    /// Location of `address`; unknown or failing addresses are cached as absent.
    pub fn lookup(&mut self, address: &str) -> Option<Location> {
        if let Some(hit) = self.cache.get(address) {
            return hit.clone();
        }

        let location = match address.parse::<IpAddr>() {
            Ok(ip) => match self.locator.locate(ip) {
                Ok(location) => location,
                Err(e) => {
                    warn!("Geolocation of {address} failed: {e}");
                    None
                }
            },
            Err(_) => None,
        };

        self.cache.insert(address.to_string(), location.clone());
        location
    }

    /// Fill the location fields of every record.
    pub fn enrich(&mut self, records: &mut [EnrichedRecord]) {
        for record in records.iter_mut() {
            record.location = self
                .lookup(&record.log.client_address)
                .unwrap_or_default();
        }
        debug!("Location cache holds {} addresses", self.cache.len());
    }
}
