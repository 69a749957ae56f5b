//! Access-log line grammar.
//!
//! Lines follow Apache's combined log format, optionally extended with the
//! virtual host name and address:
//!
//! ```text
//! 1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] "GET / HTTP/2.0" 204 0 "-" "bot" s.com 2.2.2.2
//! ```
//!
//! [`LineParser`] only splits a line into raw fields ([`ParsedRecord`]).
//! Typing and derived fields are the job of [`coerce`].

use regex::{Captures, Regex};
use snafu::prelude::*;

use crate::record::{LogRecord, ParsedRecord};

pub mod coerce;

pub use coerce::{FieldError, coerce_record};

const IP_ADDRESS: &str = r"\d{1,3}(?:\.\d{1,3}){3}|[0-9A-Fa-f]*:[0-9A-Fa-f:.]*";
const HOST_NAME: &str = r"[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.?(?::\d+)?";
const QUOTED_OR_DASH: &str = r#""(?:[^"\\]|\\.)*"|-"#;

/// Errors raised while turning a log file into records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    /// The built-in line grammar failed to compile.
    #[snafu(display("invalid log line pattern: {source}"))]
    InvalidPattern {
        /// Underlying regex error.
        source: regex::Error,
    },

    /// A line does not follow the access-log grammar.
    #[snafu(display("line {line_number}: did not recognize log line '{line}'"))]
    NoMatch {
        /// 1-based line number.
        line_number: usize,
        /// The offending line.
        line: String,
    },

    /// A line matched the grammar but holds an invalid value.
    #[snafu(display("line {line_number}: {source}"))]
    Field {
        /// 1-based line number.
        line_number: usize,
        /// What was wrong with the value.
        source: FieldError,
    },
}

/// Convenience alias for parser results.
pub type ParseResult<T> = Result<T, ParseError>;

/// Matches single access-log lines.
#[derive(Debug, Clone)]
pub struct LineParser {
    pattern: Regex,
}

impl LineParser {
    /// Compile the line grammar.
    pub fn new() -> ParseResult<Self> {
        let pattern = [
            "^",
            &format!("(?P<client_address>{IP_ADDRESS})"),
            r" - - \[(?P<timestamp>[^\]]+)\] ",
            r#""(?P<method>[A-Za-z]+) "#,
            r#"(?P<path>[^ ?#"]*)"#,
            r#"(?:\?(?P<query>[^ #"]*))?"#,
            r#"(?:#(?P<fragment>[^ "]*))?"#,
            r#" HTTP/(?P<protocol>0\.9|1\.0|1\.1|2\.0|3\.0)" "#,
            r"(?P<status>\d{3}) (?P<size>-|\d+)",
            &format!("(?: (?P<referrer>{QUOTED_OR_DASH}) (?P<user_agent>{QUOTED_OR_DASH}))?"),
            &format!("(?: (?P<server_name>{HOST_NAME}) (?P<server_address>{IP_ADDRESS}))?"),
            "$",
        ]
        .concat();

        let pattern = Regex::new(&pattern).context(InvalidPatternSnafu)?;
        Ok(Self { pattern })
    }

    /// Split one line into raw fields, or `None` if it does not match.
    pub fn parse_line(&self, line: &str) -> Option<ParsedRecord> {
        let caps = self.pattern.captures(line)?;
        let text = |name: &str| group(&caps, name).unwrap_or_default().to_string();
        let optional = |name: &str| group(&caps, name).map(str::to_string);

        Some(ParsedRecord {
            client_address: text("client_address"),
            timestamp: text("timestamp"),
            method: text("method"),
            path: text("path"),
            query: optional("query"),
            fragment: optional("fragment"),
            protocol: text("protocol"),
            status: text("status"),
            size: text("size"),
            referrer: group(&caps, "referrer").and_then(unquote),
            user_agent: group(&caps, "user_agent").and_then(unquote),
            server_name: optional("server_name"),
            server_address: optional("server_address"),
        })
    }

    /// Parse and coerce every line of a decompressed log file.
    ///
    /// Lines may end in `\n` or `\r\n`; a final newline does not produce an
    /// extra record. Bytes that are not valid UTF-8 are replaced. The first
    /// bad line aborts the whole file.
    pub fn parse_log(&self, contents: &[u8]) -> ParseResult<Vec<LogRecord>> {
        let contents = contents.strip_suffix(b"\n").unwrap_or(contents);
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for (index, raw) in contents.split(|b| *b == b'\n').enumerate() {
            let line_number = index + 1;
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw);

            let parsed = self.parse_line(&line).context(NoMatchSnafu {
                line_number,
                line: &*line,
            })?;
            let record = coerce_record(parsed).context(FieldSnafu { line_number })?;
            records.push(record);
        }
        Ok(records)
    }
}

fn group<'h>(caps: &Captures<'h>, name: &str) -> Option<&'h str> {
    caps.name(name).map(|m| m.as_str())
}

/// Strip one layer of double quotes. `-` and `"-"` mean "absent".
///
/// Escape sequences are left exactly as logged.
pub fn unquote(quoted: &str) -> Option<String> {
    if quoted == "-" || quoted == "\"-\"" {
        return None;
    }
    let inner = quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(quoted);
    Some(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{ContentType, HttpMethod, HttpProtocol, HttpScheme, StatusClass};
    use chrono::{TimeZone, Utc};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const SAFARI_15_6: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.6 Safari/605.1.15";

    fn line_with_referrer() -> String {
        format!(
            "3.3.3.3 - - [14/Aug/2022:11:12:13 +0400] \"POST /blog/2022/post.html HTTP/1.1\" \
             403 665 \"https://example.com/some/path\" \"{SAFARI_15_6}\" s.com 2.2.2.2"
        )
    }

    #[test]
    fn parses_minimal_virtual_host_line() -> TestResult {
        let parser = LineParser::new()?;
        let line = "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"GET / HTTP/2.0\" \
                    204 0 \"-\" \"bot\" s.com 2.2.2.2";

        let parsed = parser.parse_line(line).ok_or("no match")?;
        assert_eq!(parsed.client_address, "1.1.1.1");
        assert_eq!(parsed.referrer, None);
        assert_eq!(parsed.user_agent.as_deref(), Some("bot"));

        let record = coerce_record(parsed)?;
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2022, 8, 13, 1, 2, 3).unwrap()
        );
        assert_eq!(record.method, HttpMethod::Get);
        assert_eq!(record.path, "/");
        assert_eq!(record.query, None);
        assert_eq!(record.fragment, None);
        assert_eq!(record.protocol, HttpProtocol::Http20);
        assert_eq!(record.status, 204);
        assert_eq!(record.size, 0);
        assert_eq!(record.server_name.as_deref(), Some("s.com"));
        assert_eq!(record.server_address.as_deref(), Some("2.2.2.2"));
        assert_eq!(record.cool_path, "/");
        assert_eq!(record.content_type, ContentType::Markup);
        assert_eq!(record.status_class, StatusClass::Successful);
        assert_eq!(record.referrer_scheme, None);
        assert_eq!(record.referrer_host, None);
        Ok(())
    }

    #[test]
    fn parses_referrer_and_user_agent() -> TestResult {
        let parser = LineParser::new()?;
        let parsed = parser
            .parse_line(&line_with_referrer())
            .ok_or("no match")?;
        let record = coerce_record(parsed)?;

        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2022, 8, 14, 7, 12, 13).unwrap()
        );
        assert_eq!(record.method, HttpMethod::Post);
        assert_eq!(record.protocol, HttpProtocol::Http11);
        assert_eq!(record.size, 665);
        assert_eq!(record.user_agent.as_deref(), Some(SAFARI_15_6));
        assert_eq!(record.cool_path, "/blog/2022/post");
        assert_eq!(record.content_type, ContentType::Markup);
        assert_eq!(record.status_class, StatusClass::ClientError);
        assert_eq!(record.referrer_scheme, Some(HttpScheme::Https));
        assert_eq!(record.referrer_host.as_deref(), Some("example.com"));
        assert_eq!(record.referrer_path.as_deref(), Some("/some/path"));
        assert_eq!(record.referrer_query, None);
        Ok(())
    }

    #[test]
    fn parses_ipv6_client_without_headers() -> TestResult {
        let parser = LineParser::new()?;
        let line = "2a06:98c0:3600::103 - - [10/Jan/2023:14:41:04 -0600] \
                    \"GET /assets/fonts/bely-regular.woff2 HTTP/2.0\" 403 1898 \"-\" \"-\" \
                    apparebit.com 192.232.251.218";

        let record = coerce_record(parser.parse_line(line).ok_or("no match")?)?;
        assert_eq!(record.client_address, "2a06:98c0:3600::103");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2023, 1, 10, 20, 41, 4).unwrap()
        );
        assert_eq!(record.user_agent, None);
        assert_eq!(record.referrer, None);
        assert_eq!(record.content_type, ContentType::Font);
        assert_eq!(record.server_name.as_deref(), Some("apparebit.com"));
        Ok(())
    }

    #[test]
    fn optional_suffixes_are_independent() -> TestResult {
        let parser = LineParser::new()?;
        let head = "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"GET /a?x=1#frag HTTP/1.0\" 200 12";

        let bare = parser.parse_line(head).ok_or("bare")?;
        assert_eq!(bare.query.as_deref(), Some("x=1"));
        assert_eq!(bare.fragment.as_deref(), Some("frag"));
        assert_eq!(bare.user_agent, None);
        assert_eq!(bare.server_name, None);

        let host_only = parser
            .parse_line(&format!("{head} Example.com 10.0.0.1"))
            .ok_or("host only")?;
        assert_eq!(host_only.referrer, None);
        assert_eq!(host_only.server_name.as_deref(), Some("Example.com"));

        let headers_only = parser
            .parse_line(&format!("{head} \"http://a.b/\" \"curl/8\""))
            .ok_or("headers only")?;
        assert_eq!(headers_only.referrer.as_deref(), Some("http://a.b/"));
        assert_eq!(headers_only.server_address, None);
        Ok(())
    }

    #[test]
    fn unquote_keeps_escapes() {
        assert_eq!(unquote("-"), None);
        assert_eq!(unquote("\"-\""), None);
        assert_eq!(unquote("\"\""), Some(String::new()));
        assert_eq!(
            unquote(r#""say \"hi\"""#).as_deref(),
            Some(r#"say \"hi\""#)
        );
    }

    #[test]
    fn malformed_lines_do_not_match() -> TestResult {
        let parser = LineParser::new()?;
        for line in [
            "",
            "garbage",
            // status with two digits
            "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"GET / HTTP/2.0\" 20 0",
            // unsupported protocol
            "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"GET / HTTP/4.0\" 200 0",
            // unterminated user agent
            "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"GET / HTTP/2.0\" 200 0 \"-\" \"bot",
        ] {
            assert!(parser.parse_line(line).is_none(), "{line}");
        }
        Ok(())
    }

    #[test]
    fn parse_log_reports_line_numbers() -> TestResult {
        let parser = LineParser::new()?;
        let good = line_with_referrer();
        let contents = format!("{good}\r\n{good}\nnot a log line\n");

        let err = parser
            .parse_log(contents.as_bytes())
            .expect_err("third line is bad");
        assert!(matches!(err, ParseError::NoMatch { line_number: 3, .. }));

        let records = parser.parse_log(format!("{good}\n{good}\n").as_bytes())?;
        assert_eq!(records.len(), 2);
        assert!(parser.parse_log(b"")?.is_empty());
        Ok(())
    }

    #[test]
    fn parse_log_reports_invalid_values() -> TestResult {
        let parser = LineParser::new()?;
        let line = "1.1.1.1 - - [13/Aug/2022:01:02:03 +0000] \"BREW / HTTP/1.1\" 200 0";

        let err = parser.parse_log(line.as_bytes()).expect_err("unknown method");
        assert!(matches!(err, ParseError::Field { line_number: 1, .. }));
        Ok(())
    }
}
