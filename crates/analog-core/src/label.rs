//! Closed vocabularies stored as categorical columns.
//!
//! Each label enum maps to a fixed, ordered list of strings. The position of a
//! value in that list is its dictionary code in the columnar output, so the
//! order of variants is part of the on-disk format.

use std::{fmt, str::FromStr};

use snafu::prelude::*;

/// A string did not name any value of a label enum.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("\"{value}\" is not a valid {label}"))]
pub struct UnknownLabel {
    /// Name of the label enum.
    pub label: &'static str,
    /// The rejected text.
    pub value: String,
}

/// A closed set of string labels with a stable order.
pub trait Categorical: Copy + Eq + 'static {
    /// Name of the vocabulary, used in messages.
    const NAME: &'static str;
    /// All values, in dictionary order.
    const ALL: &'static [Self];
    /// String forms of [`Categorical::ALL`], in the same order.
    const LABELS: &'static [&'static str];

    /// Dictionary code of this value.
    fn code(self) -> usize;

    /// String form of this value.
    fn as_str(self) -> &'static str {
        Self::LABELS[self.code()]
    }

    /// Value with the given string form.
    fn from_label(label: &str) -> Option<Self> {
        Self::LABELS
            .iter()
            .position(|l| *l == label)
            .map(|i| Self::ALL[i])
    }
}

macro_rules! categorical {
    (
        $(#[$meta:meta])*
        $name:ident: $display:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl Categorical for $name {
            const NAME: &'static str = $display;
            const ALL: &'static [Self] = &[$($name::$variant),+];
            const LABELS: &'static [&'static str] = &[$($label),+];

            fn code(self) -> usize {
                self as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_label(s).context(UnknownLabelSnafu {
                    label: $display,
                    value: s,
                })
            }
        }
    };
}

categorical! {
    /// URL scheme of a referrer.
    HttpScheme: "HTTP scheme" {
        /// `http`
        Http => "http",
        /// `https`
        Https => "https",
    }
}

categorical! {
    /// Request method.
    HttpMethod: "HTTP method" {
        /// `CONNECT`
        Connect => "CONNECT",
        /// `DELETE`
        Delete => "DELETE",
        /// `GET`
        Get => "GET",
        /// `HEAD`
        Head => "HEAD",
        /// `OPTIONS`
        Options => "OPTIONS",
        /// `PATCH`
        Patch => "PATCH",
        /// `POST`
        Post => "POST",
        /// `PUT`
        Put => "PUT",
        /// `TRACE`
        Trace => "TRACE",
    }
}

categorical! {
    /// Protocol version from the request line. Ordered oldest first.
    HttpProtocol: "HTTP protocol version" {
        /// HTTP/0.9
        Http09 => "0.9",
        /// HTTP/1.0
        Http10 => "1.0",
        /// HTTP/1.1
        Http11 => "1.1",
        /// HTTP/2.0
        Http20 => "2.0",
        /// HTTP/3.0
        Http30 => "3.0",
    }
}

categorical! {
    /// Coarse kind of resource, derived from the request path.
    ///
    /// This is not a MIME type; it sits somewhere between MIME types and their
    /// top-level families.
    ContentType: "content type" {
        /// Configuration and manifest files.
        Config => "CONFIG",
        /// A path ending in `/`.
        Directory => "DIRECTORY",
        /// `/favicon.ico`
        Favicon => "FAVICON",
        /// Web fonts.
        Font => "FONT",
        /// Vector graphics.
        Graphic => "GRAPHIC",
        /// Raster images.
        Image => "IMAGE",
        /// JSON documents.
        Json => "JSON",
        /// HTML pages, including extension-less paths.
        Markup => "MARKUP",
        /// PHP scripts, almost always probes.
        Php => "PHP",
        /// JavaScript.
        Script => "SCRIPT",
        /// `/sitemap.xml`
        Sitemap => "SITEMAP",
        /// Stylesheets.
        Style => "STYLE",
        /// Plain text.
        Text => "TEXT",
        /// Anything else.
        Unknown => "UNKNOWN",
        /// Video files.
        Video => "VIDEO",
        /// XML documents other than the sitemap.
        Xml => "XML",
    }
}

categorical! {
    /// Class of a response status code. Ordered by numeric range.
    StatusClass: "HTTP status class" {
        /// 1xx
        Informational => "INFORMATIONAL",
        /// 2xx
        Successful => "SUCCESSFUL",
        /// 3xx
        Redirected => "REDIRECTED",
        /// 4xx
        ClientError => "CLIENT_ERROR",
        /// 5xx
        ServerError => "SERVER_ERROR",
    }
}

impl ContentType {
    /// Classify a request path.
    ///
    /// A few well-known paths are matched exactly, then a trailing slash marks
    /// a directory, then the file extension decides. Extension-less paths are
    /// treated as pages.
    pub fn of_path(path: &str) -> ContentType {
        match path {
            "/" => return ContentType::Markup,
            "/favicon.ico" => return ContentType::Favicon,
            "/sitemap.xml" => return ContentType::Sitemap,
            _ => {}
        }
        if path.ends_with('/') {
            return ContentType::Directory;
        }

        match extension(path) {
            ".cfg" | ".ini" | ".webmanifest" => ContentType::Config,
            ".woff" | ".woff2" => ContentType::Font,
            ".svg" => ContentType::Graphic,
            ".json" => ContentType::Json,
            "" | ".htm" | ".html" => ContentType::Markup,
            ".gif" | ".ico" | ".jpg" | ".jpeg" | ".png" | ".webp" => ContentType::Image,
            ".php" => ContentType::Php,
            ".js" | ".mjs" => ContentType::Script,
            ".css" => ContentType::Style,
            ".log" | ".txt" => ContentType::Text,
            ".avi" | ".mkv" | ".mp4" => ContentType::Video,
            ".xml" => ContentType::Xml,
            _ => ContentType::Unknown,
        }
    }
}

/// Extension of the last path segment including its dot, or `""`.
/// Leading dots of the segment do not start an extension.
fn extension(path: &str) -> &str {
    let segment = path.rsplit('/').next().unwrap_or(path);
    let stem_start = segment.len() - segment.trim_start_matches('.').len();
    match segment[stem_start..].rfind('.') {
        Some(dot) => &segment[stem_start + dot..],
        None => "",
    }
}

impl StatusClass {
    /// Class of a status code, or `None` outside `100..=599`.
    pub fn of_status(status: u16) -> Option<StatusClass> {
        match status {
            100..=199 => Some(StatusClass::Informational),
            200..=299 => Some(StatusClass::Successful),
            300..=399 => Some(StatusClass::Redirected),
            400..=499 => Some(StatusClass::ClientError),
            500..=599 => Some(StatusClass::ServerError),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_strings() -> Result<(), UnknownLabel> {
        assert_eq!(HttpScheme::Https.to_string(), "https");
        assert_eq!("http".parse::<HttpScheme>()?, HttpScheme::Http);
        assert_eq!(HttpMethod::Get.to_string(), "GET");
        assert_eq!("POST".parse::<HttpMethod>()?, HttpMethod::Post);
        assert_eq!(HttpProtocol::Http09.to_string(), "0.9");
        assert_eq!("1.1".parse::<HttpProtocol>()?, HttpProtocol::Http11);
        assert_eq!(
            "CLIENT_ERROR".parse::<StatusClass>()?,
            StatusClass::ClientError
        );
        Ok(())
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "BREW".parse::<HttpMethod>().expect_err("not a method");
        assert_eq!(err.value, "BREW");
        assert_eq!(err.to_string(), "\"BREW\" is not a valid HTTP method");
        assert!("get".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn codes_follow_declaration_order() {
        for (i, method) in HttpMethod::ALL.iter().enumerate() {
            assert_eq!(method.code(), i);
        }
        assert_eq!(ContentType::LABELS.len(), 16);
        assert_eq!(ContentType::Unknown.code(), 13);
        assert!(HttpProtocol::Http10 < HttpProtocol::Http20);
        assert!(StatusClass::Successful < StatusClass::ServerError);
    }

    #[test]
    fn content_type_of_path() {
        for (path, expected) in [
            ("/", ContentType::Markup),
            ("/blog", ContentType::Markup),
            ("/blog/index.html", ContentType::Markup),
            ("/assets/function.js", ContentType::Script),
            ("/sitemap.xml", ContentType::Sitemap),
            ("/feed.xml", ContentType::Xml),
            ("/assets/form.css", ContentType::Style),
            ("/blog/2022/video.avi", ContentType::Video),
            ("/favicon.ico", ContentType::Favicon),
            ("/img/logo.ico", ContentType::Image),
            ("/blog/", ContentType::Directory),
            ("/wp-login.php", ContentType::Php),
            ("/.env", ContentType::Markup),
            ("/archive.tar.gz", ContentType::Unknown),
            ("/v1.2/data", ContentType::Markup),
        ] {
            assert_eq!(ContentType::of_path(path), expected, "{path}");
        }
    }

    #[test]
    fn status_class_buckets() {
        assert_eq!(StatusClass::of_status(101), Some(StatusClass::Informational));
        assert_eq!(StatusClass::of_status(200), Some(StatusClass::Successful));
        assert_eq!(StatusClass::of_status(308), Some(StatusClass::Redirected));
        assert_eq!(StatusClass::of_status(418), Some(StatusClass::ClientError));
        assert_eq!(StatusClass::of_status(503), Some(StatusClass::ServerError));
        assert_eq!(StatusClass::of_status(99), None);
        assert_eq!(StatusClass::of_status(600), None);
    }
}
