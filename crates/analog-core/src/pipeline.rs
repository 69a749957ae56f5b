//! Ingestion and combination of monthly access logs.
//!
//! A run walks through these stages:
//!
//! 1. **Discover** the raw logs in `access-logs/`; all must belong to one
//!    domain.
//! 2. **Ingest** every month without an enriched table: decompress, parse,
//!    enrich, validate, and write `enriched-logs/<domain>-<yyyy-mm>.parquet`.
//!    The presence of that file marks the month as done, so an interrupted
//!    run resumes at the first month not yet written.
//! 3. **Clean stale outputs**: if any month was ingested, combined outputs of
//!    the domain no longer reflect the data and are removed.
//! 4. **Combine** the monthly tables into the master table, either in memory
//!    or incrementally with one row group per month, and save its coverage.
//!    An existing master table for the same range is loaded instead.
//! 5. **Validate** the master table and its request count.
//!
//! Monthly tables are never rewritten; the master table and the coverage
//! file are replaced atomically. Only one process may work on a data root at
//! a time.

use std::{io::Read, path::PathBuf};

use arrow::record_batch::RecordBatch;
use flate2::read::GzDecoder;
use log::{debug, info};
use snafu::prelude::*;

use crate::{
    coverage::Coverage,
    enrich::Enricher,
    month::MonthInYear,
    parser::LineParser,
    schema::{self, to_record_batch},
    storage::{self, SeveralDomainsSnafu},
};

mod error;
pub mod layout;
mod tables;

pub use error::{PipelineError, PipelineResult};
pub use layout::DataLayout;

pub(crate) use error::{
    ArrowSnafu, CoverageSnafu, DecompressSnafu, EnrichSnafu, ParquetSnafu, ParseSnafu,
    RowCountMismatchSnafu, StorageSnafu, ValidateSnafu,
};

/// Observer of ingestion progress. All methods default to doing nothing.
pub trait Progress {
    /// Ingestion of `month` starts with `records` parsed records.
    fn begin_month(&self, month: MonthInYear, records: u64) {
        let _ = (month, records);
    }

    /// `n` more records were processed.
    fn advance(&self, n: u64) {
        let _ = n;
    }

    /// Ingestion of `month` is complete.
    fn finish_month(&self, month: MonthInYear) {
        let _ = month;
    }
}

/// Progress observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {}

/// How monthly tables are combined into the master table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineStrategy {
    /// Concatenate all months in memory and write once.
    #[default]
    InMemory,
    /// Stream month by month into the output, one row group per month.
    Incremental,
}

/// Settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The data root.
    pub root: PathBuf,
    /// Combination strategy.
    pub combine: CombineStrategy,
    /// Delete all derived outputs before ingesting.
    pub clean: bool,
}

impl PipelineConfig {
    /// Defaults for `root`: in-memory combination, no cleaning.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            combine: CombineStrategy::default(),
            clean: false,
        }
    }
}

/// The combined table of one domain with its coverage.
#[derive(Debug, Clone)]
pub struct MasterTable {
    coverage: Coverage,
    table: RecordBatch,
}

impl MasterTable {
    /// Months, counts, and range of the table.
    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    /// The requests, in month order.
    pub fn table(&self) -> &RecordBatch {
        &self.table
    }

    /// Give up the coverage and table.
    pub fn into_parts(self) -> (Coverage, RecordBatch) {
        (self.coverage, self.table)
    }
}

/// Ingestion pipeline over one data root.
pub struct Pipeline {
    config: PipelineConfig,
    layout: DataLayout,
    parser: LineParser,
    enricher: Option<Enricher>,
}

impl Pipeline {
    /// Pipeline over an existing data root with an `access-logs` directory.
    ///
    /// Enrichment backends are opened on first use, so a root whose months
    /// are all ingested needs no location database.
    pub async fn open(config: PipelineConfig) -> PipelineResult<Self> {
        let layout = DataLayout::local(config.root.clone());
        for dir in [PathBuf::new(), layout.access_logs_dir()] {
            let exists = storage::dir_exists(layout.location(), &dir)
                .await
                .context(StorageSnafu)?;
            if !exists {
                return Err(storage::StorageError::MissingDirectory {
                    path: layout.location().resolve(&dir).display().to_string(),
                })
                .context(StorageSnafu);
            }
        }

        let parser = LineParser::new().context(ParseSnafu { path: "<grammar>" })?;
        Ok(Self {
            config,
            layout,
            parser,
            enricher: None,
        })
    }

    /// Use `enricher` instead of opening the production backends.
    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// The paths of the data root.
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Run all stages and return the validated master table.
    pub async fn run(&mut self, progress: &dyn Progress) -> PipelineResult<MasterTable> {
        if self.config.clean {
            self.clean().await?;
        }

        let fresh = self.ingest_all(progress).await?;
        let coverage = Coverage::discover(&self.layout)
            .await
            .context(CoverageSnafu)?;
        if fresh {
            self.remove_combined_outputs(Some(coverage.domain())).await?;
        }

        let master = self.combine(coverage).await?;
        self.validate(&master)?;
        Ok(master)
    }

    /// Delete every enriched table and every combined output.
    pub async fn clean(&self) -> PipelineResult<()> {
        info!("Delete enriched logs and combined outputs");
        storage::recreate_dir(self.layout.location(), &self.layout.enriched_logs_dir())
            .await
            .context(StorageSnafu)?;
        self.remove_combined_outputs(None).await
    }

    /// Remove combined outputs in the root, for `domain` or for any domain.
    async fn remove_combined_outputs(&self, domain: Option<&str>) -> PipelineResult<()> {
        let location = self.layout.location();
        let names = storage::list_file_names(location, &PathBuf::new())
            .await
            .context(StorageSnafu)?;
        for name in names {
            let Some(owner) = layout::combined_output_domain(&name) else {
                continue;
            };
            if domain.is_none_or(|d| d == owner) {
                info!("Delete stale {name}");
                storage::remove_file(location, &PathBuf::from(&name))
                    .await
                    .context(StorageSnafu)?;
            }
        }
        Ok(())
    }

    /// Ingest every raw month without an enriched table.
    ///
    /// Returns whether any month was ingested.
    pub async fn ingest_all(&mut self, progress: &dyn Progress) -> PipelineResult<bool> {
        let dir = self.layout.access_logs_dir();
        let names = storage::list_file_names(self.layout.location(), &dir)
            .await
            .context(StorageSnafu)?;

        let mut domain: Option<String> = None;
        let mut months = Vec::new();
        for name in names {
            let Some((log_domain, month)) = layout::parse_access_log_name(&name) else {
                debug!("Ignoring {name} in access logs");
                continue;
            };
            let first = domain.get_or_insert_with(|| log_domain.clone());
            if *first != log_domain {
                return Err(SeveralDomainsSnafu {
                    path: self.layout.location().resolve(&dir).display().to_string(),
                    first: first.clone(),
                    second: log_domain,
                }
                .build())
                .context(StorageSnafu);
            }
            months.push((month, dir.join(name)));
        }
        let Some(domain) = domain else {
            info!("No access logs to ingest");
            return Ok(false);
        };
        months.sort();

        let mut fresh = false;
        for (month, source) in months {
            let target = self.layout.monthly_path(&domain, month);
            let done = storage::file_exists(self.layout.location(), &target)
                .await
                .context(StorageSnafu)?;
            if done {
                debug!("Skip {month}, already ingested");
                continue;
            }
            self.ingest_month(month, &source, &target, progress).await?;
            fresh = true;
        }
        Ok(fresh)
    }

    async fn ingest_month(
        &mut self,
        month: MonthInYear,
        source: &std::path::Path,
        target: &std::path::Path,
        progress: &dyn Progress,
    ) -> PipelineResult<()> {
        info!("Ingest request data for {month}");
        let source_display = source.display().to_string();

        let compressed = storage::read_all_bytes(self.layout.location(), source)
            .await
            .context(StorageSnafu)?;
        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .context(DecompressSnafu {
                path: source_display.clone(),
            })?;

        let records = self.parser.parse_log(&raw).context(ParseSnafu {
            path: source_display,
        })?;
        progress.begin_month(month, records.len() as u64);

        let enriched = self.enricher().await?.enrich(records, progress).await.context(EnrichSnafu)?;

        let target_display = target.display().to_string();
        let table = to_record_batch(&enriched).context(ArrowSnafu {
            path: target_display.clone(),
        })?;
        schema::validate(&table).context(ValidateSnafu {
            path: target_display,
        })?;

        let bytes = tables::encode(&table, target)?;
        storage::write_new(self.layout.location(), target, &bytes)
            .await
            .context(StorageSnafu)?;

        info!("Wrote {} requests to {}", table.num_rows(), target.display());
        progress.finish_month(month);
        Ok(())
    }

    async fn enricher(&mut self) -> PipelineResult<&mut Enricher> {
        let enricher = match self.enricher.take() {
            Some(enricher) => enricher,
            None => Enricher::open(&self.layout).await.context(EnrichSnafu)?,
        };
        Ok(self.enricher.insert(enricher))
    }

    /// Load or build the master table for `coverage`.
    pub async fn combine(&self, mut coverage: Coverage) -> PipelineResult<MasterTable> {
        let location = self.layout.location();
        let master_path =
            self.layout
                .master_path(coverage.domain(), coverage.begin(), coverage.end());
        let coverage_path =
            self.layout
                .coverage_path(coverage.domain(), coverage.begin(), coverage.end());

        let exists = storage::file_exists(location, &master_path)
            .await
            .context(StorageSnafu)?;
        if exists {
            info!("Load existing master table {}", master_path.display());
            let table = tables::load(location, &master_path).await?;
            for (month, path) in coverage.files().to_vec() {
                let requests = tables::row_count(location, &path).await?;
                coverage
                    .register_count(month, requests)
                    .context(CoverageSnafu)?;
            }

            let saved = storage::file_exists(location, &coverage_path)
                .await
                .context(StorageSnafu)?;
            if !saved {
                coverage.save(&self.layout).await.context(CoverageSnafu)?;
            }
            return Ok(MasterTable { coverage, table });
        }

        let table = match self.config.combine {
            CombineStrategy::InMemory => self.combine_in_memory(&mut coverage, &master_path).await?,
            CombineStrategy::Incremental => {
                self.combine_incrementally(&mut coverage, &master_path)
                    .await?
            }
        };
        coverage.save(&self.layout).await.context(CoverageSnafu)?;
        Ok(MasterTable { coverage, table })
    }

    async fn combine_in_memory(
        &self,
        coverage: &mut Coverage,
        master_path: &std::path::Path,
    ) -> PipelineResult<RecordBatch> {
        info!("Combine monthly tables in memory");
        let location = self.layout.location();

        let mut months = Vec::with_capacity(coverage.files().len());
        for (month, path) in coverage.files().to_vec() {
            let table = tables::load(location, &path).await?;
            coverage.register(month, &table).context(CoverageSnafu)?;
            months.push(table);
        }

        let master = schema::concat(&months).context(ValidateSnafu {
            path: master_path.display().to_string(),
        })?;
        let bytes = tables::encode(&master, master_path)?;
        storage::write_atomic(location, master_path, &bytes)
            .await
            .context(StorageSnafu)?;
        info!("Wrote master table {}", master_path.display());
        Ok(master)
    }

    async fn combine_incrementally(
        &self,
        coverage: &mut Coverage,
        master_path: &std::path::Path,
    ) -> PipelineResult<RecordBatch> {
        info!("Combine monthly tables incrementally");
        let location = self.layout.location();
        let parquet_context = || ParquetSnafu {
            path: master_path.display().to_string(),
        };

        let sink = storage::open_output_sink(location, master_path)
            .await
            .context(StorageSnafu)?;
        let mut writer = tables::table_writer(sink, master_path)?;
        for (month, path) in coverage.files().to_vec() {
            let table = tables::load(location, &path).await?;
            coverage.register(month, &table).context(CoverageSnafu)?;
            writer.write(&table).with_context(|_| parquet_context())?;
            writer.flush().with_context(|_| parquet_context())?;
            debug!("Appended {} requests for {month}", table.num_rows());
        }
        let sink = writer.into_inner().with_context(|_| parquet_context())?;
        sink.finish().await.context(StorageSnafu)?;
        info!("Wrote master table {}", master_path.display());

        tables::load(location, master_path).await
    }

    /// Check the master table's layout and that it holds exactly the
    /// requests its coverage counts.
    pub fn validate(&self, master: &MasterTable) -> PipelineResult<()> {
        let path = self
            .layout
            .master_path(
                master.coverage.domain(),
                master.coverage.begin(),
                master.coverage.end(),
            )
            .display()
            .to_string();
        schema::validate(&master.table).context(ValidateSnafu { path: path.clone() })?;

        let rows = master.table.num_rows() as u64;
        let requests = master.coverage.total_requests();
        ensure!(
            rows == requests,
            RowCountMismatchSnafu {
                path,
                rows,
                requests,
            }
        );
        master.coverage.summary().context(CoverageSnafu)?;
        Ok(())
    }
}
