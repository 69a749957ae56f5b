//! Error type of the ingestion pipeline.
//!
//! Every lower-level error is wrapped with the stage and file it occurred in.
//! Context selectors are visible to the sibling modules of `pipeline`.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    coverage::CoverageError, enrich::EnrichError, parser::ParseError, schema::ValidationError,
    storage::StorageError,
};

/// Errors from running the ingestion pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    /// Reading, listing, or writing under the data root failed.
    #[snafu(display("{source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// A raw log file is not valid gzip.
    #[snafu(display("Failed to decompress {path}: {source}"))]
    Decompress {
        /// Log file relative to the data root.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A raw log file holds a line that could not be ingested.
    #[snafu(display("Failed to parse {path}, {source}"))]
    Parse {
        /// Log file relative to the data root.
        path: String,
        /// Underlying parse error with the line number.
        source: ParseError,
    },

    /// Setting up enrichment or saving its cache failed.
    #[snafu(display("Enrichment failed: {source}"))]
    Enrich {
        /// Underlying enrichment error.
        source: EnrichError,
    },

    /// A table does not have the canonical layout.
    #[snafu(display("Table {path} is invalid: {source}"))]
    Validate {
        /// The table being checked.
        path: String,
        /// Underlying validation error.
        source: ValidationError,
    },

    /// Building a columnar table failed.
    #[snafu(display("Failed to build table for {path}: {source}"))]
    Arrow {
        /// The table being built.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Encoding or decoding Parquet failed.
    #[snafu(display("Parquet error for {path}: {source}"))]
    Parquet {
        /// The file being read or written.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Coverage could not be discovered, checked, or saved.
    #[snafu(display("{source}"))]
    Coverage {
        /// Underlying coverage error.
        source: CoverageError,
    },

    /// The master table and its coverage disagree on the number of requests.
    #[snafu(display(
        "Master table {path} has {rows} rows but coverage counts {requests} requests"
    ))]
    RowCountMismatch {
        /// The master table.
        path: String,
        /// Rows in the table.
        rows: u64,
        /// Requests registered in the coverage.
        requests: u64,
    },
}

/// Convenience alias for pipeline results.
pub type PipelineResult<T> = Result<T, PipelineError>;
