//! Which months of a domain are ingested, and how many requests each holds.
//!
//! A [`Coverage`] is discovered from the enriched-log directory. Its range
//! `begin..=end` spans the earliest to the latest monthly table found, so
//! months inside the range may be missing. Present months are tracked in a
//! `RoaringBitmap` keyed by [`MonthInYear::index`]; missing months are the
//! difference between the expected range and that bitmap.
//!
//! Request, month, and day counts are accumulated month by month while the
//! master table is assembled. [`Coverage::summary`] re-derives the totals by
//! walking the range and refuses to produce a summary that disagrees with the
//! accumulated counters. Only registered months count towards the totals.

use std::{collections::BTreeMap, path::PathBuf};

use arrow::record_batch::RecordBatch;
use log::{debug, info};
use roaring::RoaringBitmap;
use snafu::prelude::*;

use crate::{
    month::MonthInYear,
    pipeline::{DataLayout, layout::parse_monthly_name},
    storage::{self, NoMonthlyFilesSnafu, SeveralDomainsSnafu, StorageError},
};

mod io;

pub use io::CoverageSummary;

/// Errors raised while discovering, filling, or persisting coverage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoverageError {
    /// The enriched-log directory is missing, empty, or mixes domains.
    #[snafu(display("{source}"))]
    Discover {
        /// Underlying storage error.
        source: StorageError,
    },

    /// A month was registered that lies outside the discovered range.
    #[snafu(display("Month {month} is outside coverage {begin} to {end}"))]
    OutOfRange {
        /// The offending month.
        month: MonthInYear,
        /// First month of the range.
        begin: MonthInYear,
        /// Last month of the range.
        end: MonthInYear,
    },

    /// A month was registered twice.
    #[snafu(display("Month {month} has already been registered"))]
    DuplicateMonth {
        /// The offending month.
        month: MonthInYear,
    },

    /// Registered counts and the coverage range disagree.
    #[snafu(display("Coverage for {domain} is inconsistent: {detail}"))]
    Inconsistent {
        /// The domain.
        domain: String,
        /// What did not add up.
        detail: String,
    },

    /// Serializing the coverage failed.
    #[snafu(display("Failed to serialize coverage: {source}"))]
    Serialize {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Writing the coverage file failed.
    #[snafu(display("Failed to write coverage: {source}"))]
    Write {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Convenience alias for coverage results.
pub type CoverageResult<T> = Result<T, CoverageError>;

/// The monthly tables of one domain and the requests registered for them.
#[derive(Debug, Clone)]
pub struct Coverage {
    domain: String,
    files: Vec<(MonthInYear, PathBuf)>,
    begin: MonthInYear,
    end: MonthInYear,
    registered: RoaringBitmap,
    requests: BTreeMap<MonthInYear, u64>,
    total: u64,
    months: u32,
    days: u32,
}

impl Coverage {
    /// Discover the monthly tables under the enriched-log directory.
    ///
    /// Fails when the directory is missing, holds no monthly tables, or holds
    /// tables for more than one domain. Other files are ignored.
    pub async fn discover(layout: &DataLayout) -> CoverageResult<Self> {
        let dir = layout.enriched_logs_dir();
        let names = storage::list_file_names(layout.location(), &dir)
            .await
            .context(DiscoverSnafu)?;
        let dir_display = layout.location().resolve(&dir).display().to_string();

        let mut domain: Option<String> = None;
        let mut files = Vec::new();
        for name in names {
            let Some((file_domain, month)) = parse_monthly_name(&name) else {
                debug!("Ignoring {name} in enriched logs");
                continue;
            };
            let first = domain.get_or_insert_with(|| file_domain.clone());
            if *first != file_domain {
                return Err(SeveralDomainsSnafu {
                    path: dir_display,
                    first: first.clone(),
                    second: file_domain,
                }
                .build())
                .context(DiscoverSnafu);
            }
            files.push((month, dir.join(name)));
        }

        match domain.and_then(|domain| Self::from_files(domain, files)) {
            Some(coverage) => Ok(coverage),
            None => Err(NoMonthlyFilesSnafu { path: dir_display }.build()).context(DiscoverSnafu),
        }
    }

    /// Coverage over an explicit list of monthly tables; `None` if empty.
    pub(crate) fn from_files(domain: String, mut files: Vec<(MonthInYear, PathBuf)>) -> Option<Self> {
        files.sort();
        let begin = files.first()?.0;
        let end = files.last()?.0;
        info!(
            "Coverage for {domain}: {} monthly file(s) from {begin} to {end}",
            files.len()
        );
        Some(Self {
            domain,
            files,
            begin,
            end,
            registered: RoaringBitmap::new(),
            requests: BTreeMap::new(),
            total: 0,
            months: 0,
            days: 0,
        })
    }

    /// The domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Earliest discovered month.
    pub fn begin(&self) -> MonthInYear {
        self.begin
    }

    /// Latest discovered month.
    pub fn end(&self) -> MonthInYear {
        self.end
    }

    /// Monthly tables in month order, as paths relative to the data root.
    pub fn files(&self) -> &[(MonthInYear, PathBuf)] {
        &self.files
    }

    /// Months of `begin..=end` without a monthly table.
    pub fn missing_months(&self) -> Vec<MonthInYear> {
        let present: RoaringBitmap = self.files.iter().map(|(m, _)| m.index()).collect();
        let expected: RoaringBitmap = (self.begin.index()..=self.end.index()).collect();
        (expected - present)
            .iter()
            .map(MonthInYear::from_index)
            .collect()
    }

    /// Record that `month` contributes the rows of `table`.
    pub fn register(&mut self, month: MonthInYear, table: &RecordBatch) -> CoverageResult<()> {
        self.register_count(month, table.num_rows() as u64)
    }

    /// Record that `month` contributes `requests` rows.
    pub fn register_count(&mut self, month: MonthInYear, requests: u64) -> CoverageResult<()> {
        ensure!(
            self.begin <= month && month <= self.end,
            OutOfRangeSnafu {
                month,
                begin: self.begin,
                end: self.end,
            }
        );
        ensure!(
            self.registered.insert(month.index()),
            DuplicateMonthSnafu { month }
        );
        self.requests.insert(month, requests);
        self.total += requests;
        self.months += 1;
        self.days += month.days();
        Ok(())
    }

    /// Requests registered for `month`, if it was registered.
    pub fn requests_in(&self, month: MonthInYear) -> Option<u64> {
        self.requests.get(&month).copied()
    }

    /// Sum of all registered requests.
    pub fn total_requests(&self) -> u64 {
        self.total
    }

    /// Totals of the registered months, cross-checked against the counters
    /// accumulated by [`Coverage::register_count`].
    pub fn summary(&self) -> CoverageResult<CoverageSummary> {
        let mut month = self.begin;
        let mut months = 0_u32;
        let mut days = 0_u32;
        let mut requests = 0_u64;
        let mut missing = Vec::new();

        loop {
            match self.requests.get(&month) {
                Some(count) => {
                    months += 1;
                    days += month.days();
                    requests += count;
                }
                None => missing.push(month),
            }
            if month >= self.end {
                break;
            }
            month = month.next();
        }

        let inconsistent = |detail: String| InconsistentSnafu {
            domain: self.domain.clone(),
            detail,
        };
        ensure!(
            months == self.months && u64::from(months) == self.registered.len(),
            inconsistent(format!(
                "{months} months in range but {} registered",
                self.months
            ))
        );
        ensure!(
            days == self.days,
            inconsistent(format!("{days} days in range but {} registered", self.days))
        );
        ensure!(
            requests == self.total,
            inconsistent(format!(
                "{requests} requests in range but {} registered",
                self.total
            ))
        );

        Ok(CoverageSummary {
            begin: self.begin.to_string(),
            days,
            domain: self.domain.clone(),
            end: self.end.to_string(),
            missing: (!missing.is_empty()).then(|| {
                missing
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            }),
            months,
            requests,
        })
    }

    /// Persist per-month counts plus the summary next to the master table.
    pub async fn save(&self, layout: &DataLayout) -> CoverageResult<()> {
        let json = io::to_json(self)?;
        let path = layout.coverage_path(&self.domain, self.begin, self.end);
        storage::write_atomic(layout.location(), &path, &json)
            .await
            .context(WriteSnafu)?;
        info!("Saved coverage to {}", path.display());
        Ok(())
    }

    pub(crate) fn registered_counts(&self) -> &BTreeMap<MonthInYear, u64> {
        &self.requests
    }
}
