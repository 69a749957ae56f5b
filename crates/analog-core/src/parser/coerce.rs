//! Typed field conversion and derived request properties.

use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::{
    label::{ContentType, HttpMethod, HttpProtocol, HttpScheme, StatusClass, UnknownLabel},
    record::{LogRecord, ParsedRecord},
};

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// A field matched the line grammar but has no valid typed value.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FieldError {
    /// The timestamp is not `day/Mon/Year:H:M:S ±zzzz`.
    #[snafu(display("invalid timestamp \"{text}\": {source}"))]
    Timestamp {
        /// The rejected text.
        text: String,
        /// Underlying chrono error.
        source: chrono::ParseError,
    },

    /// The method is not a known HTTP method.
    #[snafu(display("{source}"))]
    Method {
        /// Underlying label error.
        source: UnknownLabel,
    },

    /// The protocol version is not a known HTTP version.
    #[snafu(display("{source}"))]
    Protocol {
        /// Underlying label error.
        source: UnknownLabel,
    },

    /// The status is not a number in `100..=599`.
    #[snafu(display("invalid HTTP status \"{text}\""))]
    Status {
        /// The rejected text.
        text: String,
    },

    /// The size does not fit a 32-bit signed integer.
    #[snafu(display("invalid response size \"{text}\""))]
    Size {
        /// The rejected text.
        text: String,
    },
}

/// Convert raw fields into a typed record and fill in the derived fields.
pub fn coerce_record(parsed: ParsedRecord) -> Result<LogRecord, FieldError> {
    let timestamp = parse_timestamp(&parsed.timestamp)?;
    let method = parsed
        .method
        .to_ascii_uppercase()
        .parse::<HttpMethod>()
        .context(MethodSnafu)?;
    let protocol = parsed
        .protocol
        .parse::<HttpProtocol>()
        .context(ProtocolSnafu)?;
    let (status, status_class) = parse_status(&parsed.status)?;
    let size = parse_size(&parsed.size)?;

    let path = if parsed.path.is_empty() {
        "/".to_string()
    } else {
        parsed.path
    };
    let referrer = parse_referrer(parsed.referrer.as_deref());

    Ok(LogRecord {
        client_address: parsed.client_address,
        timestamp,
        method,
        content_type: ContentType::of_path(&path),
        cool_path: to_cool_path(&path),
        path,
        query: parsed.query,
        fragment: parsed.fragment,
        protocol,
        status,
        size,
        status_class,
        referrer_scheme: referrer.scheme,
        referrer_host: referrer.host,
        referrer_path: referrer.path,
        referrer_query: referrer.query,
        referrer_fragment: referrer.fragment,
        referrer: parsed.referrer,
        user_agent: parsed.user_agent,
        server_name: parsed.server_name.map(|name| name.to_lowercase()),
        server_address: parsed.server_address,
    })
}

/// Parse an access-log timestamp and convert it to UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, FieldError> {
    DateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|ts| ts.with_timezone(&Utc))
        .context(TimestampSnafu { text })
}

fn parse_status(text: &str) -> Result<(i16, StatusClass), FieldError> {
    let status: u16 = text.parse().ok().context(StatusSnafu { text })?;
    let class = StatusClass::of_status(status).context(StatusSnafu { text })?;
    // of_status only accepts values below 600.
    Ok((status as i16, class))
}

/// Parse a response size; `-` counts as zero.
fn parse_size(text: &str) -> Result<i32, FieldError> {
    if text == "-" {
        return Ok(0);
    }
    text.parse().ok().context(SizeSnafu { text })
}

/// Make a path suitable for a cool URL by dropping `/index.html` or `.html`.
pub fn to_cool_path(path: &str) -> String {
    let trimmed = if let Some(stripped) = path.strip_suffix("/index.html") {
        stripped
    } else if let Some(stripped) = path.strip_suffix(".html") {
        stripped
    } else {
        path
    };

    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Components of a URL-shaped referrer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Referrer {
    /// Lower-cased scheme.
    pub scheme: Option<HttpScheme>,
    /// Lower-cased host, port included.
    pub host: Option<String>,
    /// Path, possibly empty.
    pub path: Option<String>,
    /// Query without `?`.
    pub query: Option<String>,
    /// Fragment without `#`.
    pub fragment: Option<String>,
}

/// Split an `http(s)://host/path?query#fragment` referrer into its parts.
///
/// Referrers that are absent or not of that shape yield all-`None` parts.
pub fn parse_referrer(text: Option<&str>) -> Referrer {
    let Some(text) = text else {
        return Referrer::default();
    };
    let Some((scheme, rest)) = text.split_once("://") else {
        return Referrer::default();
    };
    let Ok(scheme) = scheme.to_ascii_lowercase().parse::<HttpScheme>() else {
        return Referrer::default();
    };

    let (rest, fragment) = match rest.split_once('#') {
        Some((before, fragment)) => (before, Some(fragment.to_string())),
        None => (rest, None),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((before, query)) => (before, Some(query.to_string())),
        None => (rest, None),
    };
    let (host, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, ""),
    };

    Referrer {
        scheme: Some(scheme),
        host: Some(host.to_lowercase()),
        path: Some(path.to_string()),
        query,
        fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parsed() -> ParsedRecord {
        ParsedRecord {
            client_address: "1.1.1.1".to_string(),
            timestamp: "13/Aug/2022:01:02:03 +0000".to_string(),
            method: "get".to_string(),
            path: String::new(),
            protocol: "2.0".to_string(),
            status: "204".to_string(),
            size: "-".to_string(),
            server_name: Some("S.COM".to_string()),
            server_address: Some("2.2.2.2".to_string()),
            ..ParsedRecord::default()
        }
    }

    #[test]
    fn coerces_and_derives_fields() -> Result<(), FieldError> {
        let record = coerce_record(parsed())?;

        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2022, 8, 13, 1, 2, 3).unwrap()
        );
        assert_eq!(record.method, HttpMethod::Get);
        assert_eq!(record.path, "/");
        assert_eq!(record.cool_path, "/");
        assert_eq!(record.content_type, ContentType::Markup);
        assert_eq!(record.protocol, HttpProtocol::Http20);
        assert_eq!(record.status, 204);
        assert_eq!(record.status_class, StatusClass::Successful);
        assert_eq!(record.size, 0);
        assert_eq!(record.server_name.as_deref(), Some("s.com"));
        assert_eq!(record.referrer_scheme, None);
        Ok(())
    }

    #[test]
    fn timestamp_converts_offset_to_utc() -> Result<(), FieldError> {
        assert_eq!(
            parse_timestamp("14/Aug/2022:11:12:13 +0400")?,
            Utc.with_ymd_and_hms(2022, 8, 14, 7, 12, 13).unwrap()
        );
        assert_eq!(
            parse_timestamp("10/Jan/2023:14:41:04 -0600")?,
            Utc.with_ymd_and_hms(2023, 1, 10, 20, 41, 4).unwrap()
        );
        assert!(parse_timestamp("2022-08-14 11:12:13").is_err());
        Ok(())
    }

    #[test]
    fn rejects_unknown_method_and_bad_status() {
        let mut record = parsed();
        record.method = "BREW".to_string();
        assert!(matches!(
            coerce_record(record),
            Err(FieldError::Method { .. })
        ));

        let mut record = parsed();
        record.status = "700".to_string();
        assert!(matches!(
            coerce_record(record),
            Err(FieldError::Status { .. })
        ));

        let mut record = parsed();
        record.size = "99999999999".to_string();
        assert!(matches!(coerce_record(record), Err(FieldError::Size { .. })));
    }

    #[test]
    fn cool_paths() {
        assert_eq!(to_cool_path("/path/index.html"), "/path");
        assert_eq!(to_cool_path("/path/to.html"), "/path/to");
        assert_eq!(to_cool_path("/index.html"), "/");
        assert_eq!(to_cool_path(""), "/");
        assert_eq!(to_cool_path("/nothing/changes.xml"), "/nothing/changes.xml");
    }

    #[test]
    fn referrer_components() {
        let referrer = parse_referrer(Some("HTTPS://Example.COM/some/path?q=1#top"));
        assert_eq!(referrer.scheme, Some(HttpScheme::Https));
        assert_eq!(referrer.host.as_deref(), Some("example.com"));
        assert_eq!(referrer.path.as_deref(), Some("/some/path"));
        assert_eq!(referrer.query.as_deref(), Some("q=1"));
        assert_eq!(referrer.fragment.as_deref(), Some("top"));

        let bare = parse_referrer(Some("http://example.com"));
        assert_eq!(bare.host.as_deref(), Some("example.com"));
        assert_eq!(bare.path.as_deref(), Some(""));
        assert_eq!(bare.query, None);

        assert_eq!(parse_referrer(None), Referrer::default());
        assert_eq!(parse_referrer(Some("android-app://com.x")), Referrer::default());
        assert_eq!(parse_referrer(Some("not a url")), Referrer::default());
    }
}
