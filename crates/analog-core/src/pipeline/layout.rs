//! File naming conventions of a data root.
//!
//! ```text
//! <root>/
//!   access-logs/<domain>-ssl_log-<Mmm>-<yyyy>.gz
//!   enriched-logs/<domain>-<yyyy-mm>.parquet
//!   location-db/city-<yyyy-mm-dd>.mmdb
//!   hostnames.json
//!   bots.yml                                  (optional)
//!   <domain>-<begin>-<end>.parquet            (master table)
//!   <domain>-<begin>-<end>.json               (coverage)
//! ```

use std::path::PathBuf;

use log::debug;

use crate::{
    month::MonthInYear,
    storage::{self, NoLocationDatabaseSnafu, StorageLocation, StorageResult},
};

const ACCESS_LOGS: &str = "access-logs";
const ENRICHED_LOGS: &str = "enriched-logs";
const LOCATION_DB: &str = "location-db";
const HOSTNAMES: &str = "hostnames.json";
const BOTS: &str = "bots.yml";

const ACCESS_LOG_MARKER: &str = "-ssl_log-";
const ACCESS_LOG_SUFFIX: &str = ".gz";
const MONTHLY_SUFFIX: &str = ".parquet";

/// Paths of everything under one data root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    location: StorageLocation,
}

impl DataLayout {
    /// Layout rooted at `location`.
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }

    /// Layout rooted at a local directory.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(StorageLocation::local(root))
    }

    /// The data root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Directory of raw monthly access logs.
    pub fn access_logs_dir(&self) -> PathBuf {
        PathBuf::from(ACCESS_LOGS)
    }

    /// Directory of monthly enriched tables.
    pub fn enriched_logs_dir(&self) -> PathBuf {
        PathBuf::from(ENRICHED_LOGS)
    }

    /// Directory of city databases.
    pub fn location_db_dir(&self) -> PathBuf {
        PathBuf::from(LOCATION_DB)
    }

    /// Persistent host name cache.
    pub fn hostnames_path(&self) -> PathBuf {
        PathBuf::from(HOSTNAMES)
    }

    /// Optional replacement for the bundled bot signatures.
    pub fn bots_override_path(&self) -> PathBuf {
        PathBuf::from(BOTS)
    }

    /// Enriched table for `domain` and `month`.
    pub fn monthly_path(&self, domain: &str, month: MonthInYear) -> PathBuf {
        self.enriched_logs_dir()
            .join(format!("{domain}-{month}{MONTHLY_SUFFIX}"))
    }

    /// Master table covering `begin..=end`.
    pub fn master_path(&self, domain: &str, begin: MonthInYear, end: MonthInYear) -> PathBuf {
        PathBuf::from(format!("{}.parquet", combined_stem(domain, begin, end)))
    }

    /// Coverage metadata for the master table covering `begin..=end`.
    pub fn coverage_path(&self, domain: &str, begin: MonthInYear, end: MonthInYear) -> PathBuf {
        PathBuf::from(format!("{}.json", combined_stem(domain, begin, end)))
    }

    /// The city database with the latest embedded date.
    pub async fn latest_location_db(&self) -> StorageResult<PathBuf> {
        let dir = self.location_db_dir();
        let names = storage::list_file_names(&self.location, &dir).await?;
        let latest = names.into_iter().filter(|n| is_city_db_name(n)).max();
        match latest {
            Some(name) => {
                debug!("Using location database {name}");
                Ok(dir.join(name))
            }
            None => NoLocationDatabaseSnafu {
                path: self.location.resolve(&dir).display().to_string(),
            }
            .fail(),
        }
    }
}

/// `<domain>-<begin>-<end>`, the shared stem of master table and coverage.
pub fn combined_stem(domain: &str, begin: MonthInYear, end: MonthInYear) -> String {
    format!("{domain}-{begin}-{end}")
}

/// Split `<domain>-ssl_log-<Mmm>-<yyyy>.gz` into domain and month.
pub fn parse_access_log_name(name: &str) -> Option<(String, MonthInYear)> {
    let stem = name.strip_suffix(ACCESS_LOG_SUFFIX)?;
    let split = stem.len().checked_sub(ACCESS_LOG_MARKER.len() + 8)?;
    let domain = stem.get(..split)?;
    let rest = stem.get(split..)?;
    let month = rest.strip_prefix(ACCESS_LOG_MARKER)?;
    if domain.is_empty() {
        return None;
    }
    let month = MonthInYear::parse_mmm_yyyy(month).ok()?;
    Some((domain.to_string(), month))
}

/// Split `<domain>-<yyyy-mm>.parquet` into domain and month.
pub fn parse_monthly_name(name: &str) -> Option<(String, MonthInYear)> {
    let stem = name.strip_suffix(MONTHLY_SUFFIX)?;
    let split = stem.len().checked_sub(8)?;
    let domain = stem.get(..split)?;
    let month = stem.get(split..)?.strip_prefix('-')?;
    if domain.is_empty() || !MonthInYear::is_yyyy_mm(month) {
        return None;
    }
    let month = MonthInYear::parse_yyyy_mm(month).ok()?;
    Some((domain.to_string(), month))
}

/// Domain of a combined output named `<domain>-dddd-dd-dddd-dd.<ext>`.
pub fn combined_output_domain(name: &str) -> Option<&str> {
    const RANGE: &[u8] = b"-dddd-dd-dddd-dd";

    name.char_indices()
        .filter(|&(_, c)| c == '.')
        .find_map(|(dot, _)| {
            let start = dot.checked_sub(RANGE.len())?;
            let range = name.get(start..dot)?.as_bytes();
            let matches = range.iter().zip(RANGE).all(|(&b, &p)| match p {
                b'd' => b.is_ascii_digit(),
                _ => b == p,
            });
            let has_extension = dot + 1 < name.len();
            (matches && start > 0 && has_extension).then(|| &name[..start])
        })
}

fn is_city_db_name(name: &str) -> bool {
    let Some(date) = name
        .strip_prefix("city-")
        .and_then(|rest| rest.strip_suffix(".mmdb"))
    else {
        return false;
    };
    let bytes = date.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}
