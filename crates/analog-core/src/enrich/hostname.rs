//! Reverse-DNS names for client addresses, persisted across runs.

use std::{
    collections::BTreeMap,
    io,
    net::IpAddr,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use snafu::prelude::*;

use crate::{
    pipeline::Progress,
    record::EnrichedRecord,
    storage::{self, StorageLocation},
};

use super::{EnrichResult, HostnameJsonSnafu, HostnameReadSnafu, HostnameWriteSnafu};

/// Maps an address to its host name.
pub trait ReverseDns {
    /// Resolve `address` to a host name.
    fn reverse(&self, address: IpAddr) -> io::Result<String>;
}

/// Resolver backed by the operating system (`getnameinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl ReverseDns for SystemResolver {
    fn reverse(&self, address: IpAddr) -> io::Result<String> {
        dns_lookup::lookup_addr(&address)
    }
}

/// Address to host name map backed by a JSON file.
///
/// Misses go to the resolver once. Failed lookups are remembered as `null` and
/// never retried, so a client that does not resolve costs one query ever.
pub struct HostnameCache {
    location: StorageLocation,
    rel_path: PathBuf,
    names: BTreeMap<String, Option<String>>,
    resolver: Box<dyn ReverseDns + Send>,
    lookups: usize,
}

impl HostnameCache {
    /// Load the cache from `rel_path`; a missing file starts an empty cache.
    pub async fn load(
        location: &StorageLocation,
        rel_path: &Path,
        resolver: Box<dyn ReverseDns + Send>,
    ) -> EnrichResult<Self> {
        let names = match storage::read_to_string(location, rel_path).await {
            Ok(text) => serde_json::from_str(&text).context(HostnameJsonSnafu {
                path: rel_path.display().to_string(),
            })?,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e).context(HostnameReadSnafu),
        };

        debug!("Loaded {} cached host names", names.len());
        Ok(Self {
            location: location.clone(),
            rel_path: rel_path.to_path_buf(),
            names,
            resolver,
            lookups: 0,
        })
    }

    /// Number of cached addresses, failures included.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Host name for `address`, resolving it on first sight.
    pub fn lookup(&mut self, address: &str) -> Option<String> {
        if let Some(name) = self.names.get(address) {
            return name.clone();
        }

        self.lookups += 1;
        let name = match address.parse::<IpAddr>() {
            Ok(ip) => match self.resolver.reverse(ip) {
                Ok(name) => Some(name.to_lowercase()),
                Err(e) => {
                    warn!("Reverse lookup of {address} failed: {e}");
                    None
                }
            },
            Err(_) => {
                warn!("Not an IP address: {address}");
                None
            }
        };

        self.names.insert(address.to_string(), name.clone());
        name
    }

    /// Fill `client_name` for every record.
    pub fn enrich(&mut self, records: &mut [EnrichedRecord], progress: &dyn Progress) {
        let before = self.lookups;
        for record in records.iter_mut() {
            record.client_name = self.lookup(&record.log.client_address);
            progress.advance(1);
        }
        debug!(
            "Resolved {} new addresses for {} records",
            self.lookups - before,
            records.len()
        );
    }

    /// Write the cache back, sorted by address, through an atomic replace.
    pub async fn save(&self) -> EnrichResult<()> {
        let json = serde_json::to_vec_pretty(&self.names).context(HostnameJsonSnafu {
            path: self.rel_path.display().to_string(),
        })?;
        storage::write_atomic(&self.location, &self.rel_path, &json)
            .await
            .context(HostnameWriteSnafu)
    }
}
