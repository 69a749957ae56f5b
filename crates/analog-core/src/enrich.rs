//! Enrichment of parsed requests with facts about the client.
//!
//! Three passes run over each monthly batch:
//!
//! 1. host names from reverse DNS, cached in `hostnames.json`;
//! 2. geolocation from a MaxMind city database;
//! 3. user-agent classification plus the bot-signature match.
//!
//! Each pass writes only its own fields, so their order does not matter and
//! the batch keeps its length. A failing lookup leaves that record's fields
//! empty and the run continues; only setup and cache persistence can fail.

use std::path::Path;

use log::info;
use snafu::prelude::*;

use crate::{
    pipeline::{DataLayout, Progress},
    record::{EnrichedRecord, LogRecord},
    storage::{self, StorageError, StorageLocation},
};

pub mod agent;
pub mod bots;
pub mod hostname;
pub mod location;

pub use agent::{AgentClassifier, UserAgentParser, WootheeParser};
pub use bots::{BotDatabase, BotSignature};
pub use hostname::{HostnameCache, ReverseDns, SystemResolver};
pub use location::{CityDatabase, GeoLocator, LocationCache, LookupError};

/// Errors from setting up or persisting enrichment state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EnrichError {
    /// The host name cache could not be read.
    #[snafu(display("Failed to read host name cache: {source}"))]
    HostnameRead {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The host name cache is not a JSON object of strings and nulls.
    #[snafu(display("Host name cache {path} is not valid JSON: {source}"))]
    HostnameJson {
        /// Cache path relative to the data root.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The host name cache could not be written back.
    #[snafu(display("Failed to save host name cache: {source}"))]
    HostnameWrite {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The city database could not be opened.
    #[snafu(display("Failed to open location database {path}: {source}"))]
    LocationDb {
        /// Database path.
        path: String,
        /// Underlying reader error.
        source: maxminddb::MaxMindDBError,
    },

    /// A bot-signature file could not be read.
    #[snafu(display("Failed to read bot signatures: {source}"))]
    BotRead {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The bot-signature YAML does not describe a list of signatures.
    #[snafu(display("Invalid bot signature list: {source}"))]
    BotYaml {
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },

    /// A bot-signature pattern does not compile.
    #[snafu(display("Invalid bot signature pattern: {source}"))]
    BotPattern {
        /// Underlying regex error.
        source: regex::Error,
    },

    /// The bot-signature list is empty.
    #[snafu(display("Bot signature list is empty"))]
    EmptyBotDatabase,

    /// Locating the newest city database failed.
    #[snafu(display("{source}"))]
    FindLocationDb {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Convenience alias for enrichment results.
pub type EnrichResult<T> = Result<T, EnrichError>;

/// The three enrichment passes and their state.
pub struct Enricher {
    hostnames: HostnameCache,
    locations: LocationCache,
    agents: AgentClassifier,
}

impl Enricher {
    /// Assemble an enricher from explicit backends.
    pub fn new(hostnames: HostnameCache, locations: LocationCache, agents: AgentClassifier) -> Self {
        Self {
            hostnames,
            locations,
            agents,
        }
    }

    /// Enricher with the production backends for a data root: the system
    /// resolver, the newest city database, woothee, and the bot signatures
    /// from `bots.yml` in the root or the bundled list.
    pub async fn open(layout: &DataLayout) -> EnrichResult<Self> {
        let location = layout.location();

        let hostnames = HostnameCache::load(
            location,
            &layout.hostnames_path(),
            Box::new(SystemResolver),
        )
        .await?;

        let db_path = layout
            .latest_location_db()
            .await
            .context(FindLocationDbSnafu)?;
        let city_db = CityDatabase::open(&location.resolve(&db_path))?;
        let locations = LocationCache::new(Box::new(city_db));

        let bots = load_bot_database(location, &layout.bots_override_path()).await?;
        let agents = AgentClassifier::new(Box::new(WootheeParser::new()), bots);

        Ok(Self::new(hostnames, locations, agents))
    }

    /// Run all passes over one batch and persist the host name cache.
    pub async fn enrich(
        &mut self,
        records: Vec<LogRecord>,
        progress: &dyn Progress,
    ) -> EnrichResult<Vec<EnrichedRecord>> {
        let mut records: Vec<EnrichedRecord> = records.into_iter().map(Into::into).collect();

        self.hostnames.enrich(&mut records, progress);
        self.hostnames.save().await?;
        self.locations.enrich(&mut records);
        self.agents.enrich(&mut records);

        Ok(records)
    }
}

/// The root's `bots.yml` if present, otherwise the bundled signatures.
pub async fn load_bot_database(
    location: &StorageLocation,
    override_path: &Path,
) -> EnrichResult<BotDatabase> {
    match storage::read_to_string(location, override_path).await {
        Ok(yaml) => {
            info!("Using bot signatures from {}", override_path.display());
            BotDatabase::from_yaml(&yaml)
        }
        Err(e) if e.is_not_found() => BotDatabase::bundled(),
        Err(e) => Err(e).context(BotReadSnafu),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        enrich::{hostname::tests::FakeResolver, location::tests::FakeLocator},
        parser::LineParser,
        pipeline::NoProgress,
    };
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// A minimal record for `address` with an optional User-Agent.
    pub(crate) fn record(address: &str, user_agent: Option<&str>) -> EnrichedRecord {
        let line = format!(
            "{address} - - [13/Aug/2022:01:02:03 +0000] \"GET / HTTP/2.0\" 200 0 \"-\" {}",
            match user_agent {
                Some(ua) => format!("\"{ua}\""),
                None => "-".to_string(),
            }
        );
        let parser = LineParser::new().expect("grammar compiles");
        let mut records = parser.parse_log(line.as_bytes()).expect("valid line");
        EnrichedRecord::from(records.remove(0))
    }

    #[tokio::test]
    async fn enrich_is_additive_and_keeps_row_count() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let mut resolver = FakeResolver::default();
        resolver
            .names
            .insert("1.1.1.1".parse()?, "one.one.one.one".to_string());
        let hostnames =
            HostnameCache::load(&location, Path::new("hostnames.json"), Box::new(resolver))
                .await?;
        let locations =
            LocationCache::new(Box::new(FakeLocator::with("1.1.1.1", "Sydney", "AU")));
        let agents = AgentClassifier::new(Box::new(WootheeParser::new()), BotDatabase::bundled()?);
        let mut enricher = Enricher::new(hostnames, locations, agents);

        let input: Vec<LogRecord> = vec![
            record("1.1.1.1", Some("LinkedInBot")).log,
            record("5.5.5.5", None).log,
        ];
        let output = enricher.enrich(input.clone(), &NoProgress).await?;

        assert_eq!(output.len(), input.len());
        for (before, after) in input.iter().zip(&output) {
            assert_eq!(before, &after.log);
        }

        assert_eq!(output[0].client_name.as_deref(), Some("one.one.one.one"));
        assert_eq!(output[0].location.country.as_deref(), Some("AU"));
        assert!(output[0].is_bot2);

        assert_eq!(output[1].client_name, None);
        assert_eq!(output[1].location.latitude, None);
        assert_eq!(output[1].agent, None);
        assert!(!output[1].is_any_bot());

        let saved = std::fs::read_to_string(tmp.path().join("hostnames.json"))?;
        assert!(saved.contains("one.one.one.one"));
        assert!(saved.contains("5.5.5.5"));
        Ok(())
    }

    #[tokio::test]
    async fn bot_override_replaces_bundled_list() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        std::fs::write(
            tmp.path().join("bots.yml"),
            "- name: Only\n  regex: 'onlybot'\n  category: Test\n  url: ''\n",
        )?;

        let mut bots = load_bot_database(&location, Path::new("bots.yml")).await?;
        assert_eq!(bots.len(), 1);
        assert!(bots.test("OnlyBot/1.0"));
        assert!(!bots.test("LinkedInBot"));

        let mut bundled = load_bot_database(&location, Path::new("missing.yml")).await?;
        assert!(bundled.test("LinkedInBot"));
        Ok(())
    }
}
