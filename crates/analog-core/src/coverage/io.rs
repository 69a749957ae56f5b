//! JSON form of coverage metadata.
//!
//! ```json
//! {
//!     "2023-01": {
//!         "requests": 3
//!     },
//!     "summary": {
//!         "begin": "2023-01",
//!         "days": 59,
//!         "domain": "example.com",
//!         "end": "2023-02",
//!         "missing": null,
//!         "months": 2,
//!         "requests": 5
//!     }
//! }
//! ```
//!
//! Keys are sorted and the document is indented by four spaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Serializer, Value, json, ser::PrettyFormatter};
use snafu::prelude::*;

use super::{Coverage, CoverageResult, SerializeSnafu};

/// Totals of a coverage range, as stored under `"summary"`.
///
/// Fields are declared in key order so the JSON stays sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// First month, `yyyy-mm`.
    pub begin: String,
    /// Days in the range.
    pub days: u32,
    /// The domain.
    pub domain: String,
    /// Last month, `yyyy-mm`.
    pub end: String,
    /// Months in the range without data, comma separated; `None` if complete.
    pub missing: Option<String>,
    /// Months in the range.
    pub months: u32,
    /// Total requests.
    pub requests: u64,
}

/// Serialize per-month counts and the checked summary.
pub(super) fn to_json(coverage: &Coverage) -> CoverageResult<Vec<u8>> {
    let summary = coverage.summary()?;

    let mut document: BTreeMap<String, Value> = coverage
        .registered_counts()
        .iter()
        .map(|(month, requests)| (month.to_string(), json!({ "requests": requests })))
        .collect();
    document.insert(
        "summary".to_string(),
        serde_json::to_value(&summary).context(SerializeSnafu)?,
    );

    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    document.serialize(&mut serializer).context(SerializeSnafu)?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{month::MonthInYear, pipeline::DataLayout};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn saved_document_is_sorted_and_complete() -> TestResult {
        let tmp = TempDir::new()?;
        let layout = DataLayout::local(tmp.path());
        let jan = MonthInYear::new(2023, 1)?;
        let mar = MonthInYear::new(2023, 3)?;
        let files = vec![
            (mar, layout.monthly_path("example.com", mar)),
            (jan, layout.monthly_path("example.com", jan)),
        ];
        let mut coverage =
            Coverage::from_files("example.com".to_string(), files).ok_or("non-empty")?;
        coverage.register_count(jan, 3)?;
        coverage.register_count(mar, 2)?;
        coverage.save(&layout).await?;

        let path = tmp.path().join("example.com-2023-01-2023-03.json");
        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("\n    \"2023-01\": {\n        \"requests\": 3\n    }"));
        let jan_at = text.find("\"2023-01\"").ok_or("jan")?;
        let mar_at = text.find("\"2023-03\"").ok_or("mar")?;
        let summary_at = text.find("\"summary\"").ok_or("summary")?;
        assert!(jan_at < mar_at && mar_at < summary_at);

        let value: Value = serde_json::from_str(&text)?;
        let summary: CoverageSummary = serde_json::from_value(value["summary"].clone())?;
        assert_eq!(
            summary,
            CoverageSummary {
                begin: "2023-01".into(),
                days: 62,
                domain: "example.com".into(),
                end: "2023-03".into(),
                missing: Some("2023-02".into()),
                months: 2,
                requests: 5,
            }
        );
        assert!(!tmp.path().join("example.com-2023-01-2023-03.json.tmp").exists());
        Ok(())
    }
}
