//! Parquet encoding and decoding of canonical tables.

use std::{io::Write, path::Path};

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    schema::{self, log_schema},
    storage::{self, StorageLocation},
};

use super::{ParquetSnafu, PipelineResult, StorageSnafu, ValidateSnafu};

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Parquet writer over `sink` with the canonical schema.
pub(crate) fn table_writer<W: Write + Send>(
    sink: W,
    path: &Path,
) -> PipelineResult<ArrowWriter<W>> {
    ArrowWriter::try_new(sink, log_schema(), Some(writer_properties())).context(ParquetSnafu {
        path: path.display().to_string(),
    })
}

/// Encode one table as a complete Parquet file in memory.
pub(crate) fn encode(table: &RecordBatch, path: &Path) -> PipelineResult<Vec<u8>> {
    let mut writer = table_writer(Vec::new(), path)?;
    let context = || ParquetSnafu {
        path: path.display().to_string(),
    };
    writer.write(table).with_context(|_| context())?;
    writer.into_inner().with_context(|_| context())
}

/// Decode a Parquet file into one canonical table.
///
/// Dictionary columns come back with only the values the file uses, so the
/// decoded batches are normalized through [`schema::concat`].
pub(crate) fn decode(bytes: Vec<u8>, path: &Path) -> PipelineResult<RecordBatch> {
    let context = || ParquetSnafu {
        path: path.display().to_string(),
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .with_context(|_| context())?
        .build()
        .with_context(|_| context())?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch
            .map_err(parquet::errors::ParquetError::from)
            .with_context(|_| context())?;
        batches.push(batch);
    }

    schema::concat(&batches).context(ValidateSnafu {
        path: path.display().to_string(),
    })
}

/// Rows recorded in the Parquet footer of `rel_path`, without decoding data.
pub(crate) async fn row_count(location: &StorageLocation, rel_path: &Path) -> PipelineResult<u64> {
    let bytes = storage::read_all_bytes(location, rel_path)
        .await
        .context(StorageSnafu)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes)).context(
        ParquetSnafu {
            path: rel_path.display().to_string(),
        },
    )?;
    Ok(builder.metadata().file_metadata().num_rows() as u64)
}

/// Read a canonical table from `rel_path`.
pub(crate) async fn load(location: &StorageLocation, rel_path: &Path) -> PipelineResult<RecordBatch> {
    let bytes = storage::read_all_bytes(location, rel_path)
        .await
        .context(StorageSnafu)?;
    decode(bytes, rel_path)
}
