//! User-agent classification: browser, OS, device, and both bot signals.

use std::collections::HashMap;

use log::debug;

use crate::record::{AgentInfo, EnrichedRecord};

use super::bots::BotDatabase;

/// Value woothee uses for fields it could not determine.
const UNKNOWN: &str = "UNKNOWN";

/// Turns a User-Agent header into structured fields.
pub trait UserAgentParser {
    /// Classify `user_agent`.
    fn parse(&self, user_agent: &str) -> AgentInfo;
}

/// Parser backed by the woothee project's rule set.
///
/// Woothee does not report device vendor or model, so `device_brand` and
/// `device_model` stay empty and `device_family` carries woothee's category
/// (`pc`, `smartphone`, `crawler`, ...).
pub struct WootheeParser {
    parser: woothee::parser::Parser,
}

impl WootheeParser {
    /// Create a parser.
    pub fn new() -> Self {
        Self {
            parser: woothee::parser::Parser::new(),
        }
    }
}

impl Default for WootheeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentParser for WootheeParser {
    fn parse(&self, user_agent: &str) -> AgentInfo {
        let Some(result) = self.parser.parse(user_agent) else {
            return AgentInfo {
                agent_family: UNKNOWN.to_string(),
                os_family: UNKNOWN.to_string(),
                device_family: UNKNOWN.to_string(),
                ..AgentInfo::default()
            };
        };

        AgentInfo {
            agent_family: result.name.to_string(),
            agent_version: dotted_version(&result.version.to_string()),
            os_family: result.os.to_string(),
            os_version: dotted_version(&result.os_version.to_string()),
            device_family: result.category.to_string(),
            device_brand: String::new(),
            device_model: String::new(),
            is_bot: result.category == "crawler",
        }
    }
}

/// Join the non-empty dotted components of a version; unknown becomes empty.
fn dotted_version(raw: &str) -> String {
    if raw == UNKNOWN {
        return String::new();
    }
    raw.split('.')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

/// Runs the user-agent parser and the bot database over records.
pub struct AgentClassifier {
    parser: Box<dyn UserAgentParser + Send>,
    bots: BotDatabase,
    cache: HashMap<String, AgentInfo>,
}

impl AgentClassifier {
    /// Combine a user-agent parser with a bot-signature database.
    pub fn new(parser: Box<dyn UserAgentParser + Send>, bots: BotDatabase) -> Self {
        Self {
            parser,
            bots,
            cache: HashMap::new(),
        }
    }

    /// The bot-signature database.
    pub fn bots(&mut self) -> &mut BotDatabase {
        &mut self.bots
    }

    /// Classify one header, caching the result.
    pub fn classify(&mut self, user_agent: &str) -> AgentInfo {
        if let Some(info) = self.cache.get(user_agent) {
            return info.clone();
        }
        let info = self.parser.parse(user_agent);
        self.cache.insert(user_agent.to_string(), info.clone());
        info
    }

    /// Fill the agent fields and both bot signals of every record.
    ///
    /// Records without a User-Agent keep `agent = None` and `is_bot2 = false`
    /// and cause no lookups.
    pub fn enrich(&mut self, records: &mut [EnrichedRecord]) {
        for record in records.iter_mut() {
            let Some(user_agent) = record.log.user_agent.as_deref() else {
                record.agent = None;
                record.is_bot2 = false;
                continue;
            };
            let agent = self.classify(user_agent);
            record.is_bot2 = self.bots.test(user_agent);
            record.agent = Some(agent);
        }
        debug!("User agent cache holds {} entries", self.cache.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{EnrichResult, tests::record};

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const GOOGLEBOT: &str =
        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    #[test]
    fn dotted_version_drops_empty_parts() {
        assert_eq!(dotted_version("120.0.0.0"), "120.0.0.0");
        assert_eq!(dotted_version("10..2."), "10.2");
        assert_eq!(dotted_version(""), "");
        assert_eq!(dotted_version("UNKNOWN"), "");
    }

    #[test]
    fn woothee_recognizes_browsers_and_crawlers() {
        let parser = WootheeParser::new();

        let chrome = parser.parse(CHROME);
        assert_eq!(chrome.agent_family, "Chrome");
        assert!(chrome.agent_version.starts_with("120"));
        assert_eq!(chrome.device_family, "pc");
        assert_eq!(chrome.device_brand, "");
        assert!(!chrome.is_bot);

        let google = parser.parse(GOOGLEBOT);
        assert_eq!(google.device_family, "crawler");
        assert!(google.is_bot);
    }

    #[test]
    fn absent_user_agent_gets_defaults() -> EnrichResult<()> {
        let mut classifier =
            AgentClassifier::new(Box::new(WootheeParser::new()), BotDatabase::bundled()?);
        let mut records = vec![
            record("1.1.1.1", None),
            record("1.1.1.1", Some("LinkedInBot")),
            record("1.1.1.1", Some(CHROME)),
        ];

        classifier.enrich(&mut records);

        assert_eq!(records[0].agent, None);
        assert!(!records[0].is_bot2);
        assert!(!records[0].is_any_bot());

        assert!(records[1].is_bot2);
        assert!(records[1].is_any_bot());

        let chrome = records[2].agent.as_ref().expect("parsed");
        assert_eq!(chrome.agent_family, "Chrome");
        assert!(!records[2].is_any_bot());
        Ok(())
    }
}
