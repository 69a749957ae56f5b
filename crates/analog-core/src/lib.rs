//! Core of an access-log ingestion pipeline.
//!
//! This crate turns monthly, gzip-compressed web server access logs into
//! validated, enriched Parquet tables and combines them into one master table
//! per domain:
//!
//! - Line parsing and typed field coercion (`parser` module).
//! - Enrichment with reverse DNS, geolocation, user-agent classification,
//!   and a curated bot-signature database (`enrich` module).
//! - The canonical column layout with best-effort coercion and strict
//!   validation (`schema` module).
//! - Crash-safe file writes and data-root access (`storage` module).
//! - Month-by-month coverage tracking with request counts (`coverage`
//!   module).
//! - The resumable ingestion and combination stages (`pipeline` module).
//! - Simple filtering and counting over the result (`analysis` module).
//!
//! The crate never prints; progress is reported through
//! [`pipeline::Progress`] and diagnostics through the `log` facade.
#![deny(missing_docs)]
pub mod analysis;
pub mod coverage;
pub mod enrich;
pub mod label;
pub mod month;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod storage;

pub use month::MonthInYear;
pub use pipeline::{CombineStrategy, MasterTable, Pipeline, PipelineConfig, PipelineError};
