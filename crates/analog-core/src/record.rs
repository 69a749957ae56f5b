//! Request records at each stage of ingestion.

use chrono::{DateTime, Utc};

use crate::label::{ContentType, HttpMethod, HttpProtocol, HttpScheme, StatusClass};

/// One log line split into its raw fields.
///
/// Quoted fields are already unquoted; `-` placeholders are `None`.
/// Nothing else is interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedRecord {
    /// Client IPv4 or IPv6 address.
    pub client_address: String,
    /// Timestamp text without the brackets.
    pub timestamp: String,
    /// Method token from the request line.
    pub method: String,
    /// Request path, possibly empty.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Fragment without the leading `#`.
    pub fragment: Option<String>,
    /// Protocol version, such as `1.1`.
    pub protocol: String,
    /// Three status digits.
    pub status: String,
    /// Response size digits, or `-`.
    pub size: String,
    /// Referrer header.
    pub referrer: Option<String>,
    /// User-Agent header.
    pub user_agent: Option<String>,
    /// Virtual host name.
    pub server_name: Option<String>,
    /// Virtual host address.
    pub server_address: Option<String>,
}

/// A request with typed fields and the values derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Client IPv4 or IPv6 address.
    pub client_address: String,
    /// Request time in UTC.
    pub timestamp: DateTime<Utc>,
    /// Request method.
    pub method: HttpMethod,
    /// Request path, `/` when the line had none.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Fragment without the leading `#`.
    pub fragment: Option<String>,
    /// Protocol version.
    pub protocol: HttpProtocol,
    /// Response status code.
    pub status: i16,
    /// Response size in bytes.
    pub size: i32,
    /// Referrer header.
    pub referrer: Option<String>,
    /// User-Agent header.
    pub user_agent: Option<String>,
    /// Lower-cased virtual host name.
    pub server_name: Option<String>,
    /// Virtual host address.
    pub server_address: Option<String>,

    /// Kind of resource requested.
    pub content_type: ContentType,
    /// Path without `.html` or a trailing `/index.html`.
    pub cool_path: String,
    /// Class of the status code.
    pub status_class: StatusClass,
    /// Lower-cased scheme of a URL-shaped referrer.
    pub referrer_scheme: Option<HttpScheme>,
    /// Lower-cased host of a URL-shaped referrer.
    pub referrer_host: Option<String>,
    /// Path of a URL-shaped referrer.
    pub referrer_path: Option<String>,
    /// Query of a URL-shaped referrer, without `?`.
    pub referrer_query: Option<String>,
    /// Fragment of a URL-shaped referrer, without `#`.
    pub referrer_fragment: Option<String>,
}

/// Results of the geolocation lookup for one client address.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
    /// English city name.
    pub city: Option<String>,
    /// ISO 3166-1 alpha-2 country code.
    pub country: Option<String>,
}

/// What the user-agent parser made of a User-Agent header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentInfo {
    /// Browser or crawler name.
    pub agent_family: String,
    /// Dotted browser version, possibly empty.
    pub agent_version: String,
    /// Operating system name.
    pub os_family: String,
    /// Dotted OS version, possibly empty.
    pub os_version: String,
    /// Device class.
    pub device_family: String,
    /// Device vendor, possibly empty.
    pub device_brand: String,
    /// Device model, possibly empty.
    pub device_model: String,
    /// The parser itself classified the agent as a crawler.
    pub is_bot: bool,
}

/// A fully ingested request: the log record plus everything learned about the
/// client.
///
/// The enrichment fields start out empty and are filled by independent passes,
/// each of which only touches its own fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    /// Parsed and derived request data.
    pub log: LogRecord,
    /// Reverse-DNS name of the client address.
    pub client_name: Option<String>,
    /// Geolocation of the client address.
    pub location: Location,
    /// User-agent classification; `None` when the request had no header.
    pub agent: Option<AgentInfo>,
    /// Matched by the curated bot-signature database.
    pub is_bot2: bool,
}

impl EnrichedRecord {
    /// True if either bot signal fired.
    pub fn is_any_bot(&self) -> bool {
        self.is_bot() || self.is_bot2
    }

    /// The user-agent parser's bot signal; false without a User-Agent.
    pub fn is_bot(&self) -> bool {
        self.agent.as_ref().is_some_and(|a| a.is_bot)
    }
}

impl From<LogRecord> for EnrichedRecord {
    fn from(log: LogRecord) -> Self {
        EnrichedRecord {
            log,
            client_name: None,
            location: Location::default(),
            agent: None,
            is_bot2: false,
        }
    }
}
