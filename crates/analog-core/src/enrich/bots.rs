//! Curated database of bot User-Agent signatures.
//!
//! The database is a YAML list of `{name, regex, category, url}` entries.
//! Every pattern is compiled into one [`RegexSet`], so a single scan tells
//! both whether any signature matches and which ones do. Entries are ordered
//! most specific first; the final entry is a catch-all that only wins when
//! nothing more specific matched.

use std::collections::HashMap;

use regex::{RegexSet, RegexSetBuilder};
use serde::Deserialize;
use snafu::prelude::*;

use super::{BotPatternSnafu, BotYamlSnafu, EmptyBotDatabaseSnafu, EnrichResult};

/// The signature list compiled into the binary.
pub const DEFAULT_BOTS_YML: &str = include_str!("bots.yml");

/// One known bot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotSignature {
    /// Display name.
    pub name: String,
    /// Pattern matched case-insensitively against the User-Agent.
    pub regex: String,
    /// Kind of bot, such as `Search bot`.
    #[serde(default)]
    pub category: String,
    /// Where to learn more; may be empty.
    #[serde(default)]
    pub url: String,
}

/// Bot signatures plus per-agent caches.
#[derive(Debug)]
pub struct BotDatabase {
    signatures: Vec<BotSignature>,
    patterns: RegexSet,
    cache: HashMap<String, Option<usize>>,
}

impl BotDatabase {
    /// Parse and compile a YAML signature list.
    pub fn from_yaml(source: &str) -> EnrichResult<Self> {
        let signatures: Vec<BotSignature> = serde_yaml::from_str(source).context(BotYamlSnafu)?;
        ensure!(!signatures.is_empty(), EmptyBotDatabaseSnafu);

        let patterns = RegexSetBuilder::new(signatures.iter().map(|s| s.regex.as_str()))
            .case_insensitive(true)
            .build()
            .context(BotPatternSnafu)?;

        Ok(Self {
            signatures,
            patterns,
            cache: HashMap::new(),
        })
    }

    /// The signature list compiled into the binary.
    pub fn bundled() -> EnrichResult<Self> {
        Self::from_yaml(DEFAULT_BOTS_YML)
    }

    /// Number of signatures, catch-all included.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Always false; construction rejects empty lists.
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Whether any signature matches `user_agent`.
    pub fn test(&mut self, user_agent: &str) -> bool {
        self.matching_index(user_agent).is_some()
    }

    /// The most specific signature matching `user_agent`, if any.
    pub fn lookup(&mut self, user_agent: &str) -> Option<&BotSignature> {
        let index = self.matching_index(user_agent)?;
        self.signatures.get(index)
    }

    fn matching_index(&mut self, user_agent: &str) -> Option<usize> {
        if let Some(hit) = self.cache.get(user_agent) {
            return *hit;
        }
        // Indices come back in ascending order, so the catch-all comes last.
        let hit = self.patterns.matches(user_agent).iter().next();
        self.cache.insert(user_agent.to_string(), hit);
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::EnrichError;

    const SAFARI: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.6.1 Safari/605.1.15";

    #[test]
    fn bundled_database_knows_linkedin() -> EnrichResult<()> {
        let mut bots = BotDatabase::bundled()?;

        assert!(!bots.test(SAFARI));
        assert!(bots.lookup(SAFARI).is_none());

        assert!(bots.test("LinkedInBot"));
        let bot = bots.lookup("LinkedInBot").cloned().expect("known bot");
        assert_eq!(bot.name, "LinkedIn Bot");
        assert_eq!(bot.category, "Social Media Agent");
        assert_eq!(bot.url, "http://www.linkedin.com");
        Ok(())
    }

    #[test]
    fn specific_signatures_win_over_catch_all() -> EnrichResult<()> {
        let mut bots = BotDatabase::bundled()?;

        let google = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
        assert_eq!(bots.lookup(google).map(|b| b.name.as_str()), Some("Googlebot"));

        let unknown = "FancyNewCrawler/0.1";
        assert_eq!(
            bots.lookup(unknown).map(|b| b.name.as_str()),
            Some("Generic Bot")
        );
        assert!(bots.test("bot"));
        Ok(())
    }

    #[test]
    fn rejects_invalid_databases() {
        assert!(matches!(
            BotDatabase::from_yaml("[]"),
            Err(EnrichError::EmptyBotDatabase)
        ));
        assert!(matches!(
            BotDatabase::from_yaml("- name: Broken\n  regex: '(unclosed'\n"),
            Err(EnrichError::BotPattern { .. })
        ));
        assert!(matches!(
            BotDatabase::from_yaml("not: [a, list"),
            Err(EnrichError::BotYaml { .. })
        ));
    }
}
