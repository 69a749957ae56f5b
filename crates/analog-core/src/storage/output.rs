use std::{
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::fs;

use crate::storage::{
    StorageLocation, StorageResult, TempFileGuard, create_parent_dir, io_at, temp_sibling,
};

/// A streaming, all-or-nothing file writer.
///
/// Bytes written through the sink land in `<name>.tmp` next to the target.
/// [`OutputSink::finish`] flushes, syncs, and renames the temp file over the
/// target in one step. Dropping the sink without finishing removes the temp
/// file and leaves the target as it was. A process that dies before either
/// happens leaves the temp file behind and the target untouched.
///
/// The sink implements [`Write`] so it can be handed to encoders such as
/// `parquet::arrow::ArrowWriter`, which own their writer and give it back from
/// `into_inner`.
pub struct OutputSink {
    tmp_path: PathBuf,
    target: PathBuf,
    // Parquet's writer needs std::io::Write, not the tokio traits.
    writer: BufWriter<std::fs::File>,
    guard: TempFileGuard,
}

impl OutputSink {
    /// Final path the sink commits to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush, fsync, and commit to the final location.
    pub async fn finish(mut self) -> StorageResult<()> {
        self.writer.flush().context(io_at(&self.tmp_path))?;
        self.writer
            .get_ref()
            .sync_all()
            .context(io_at(&self.tmp_path))?;
        fs::rename(&self.tmp_path, &self.target)
            .await
            .context(io_at(&self.target))?;

        self.guard.disarm();
        log::debug!("Committed {}", self.target.display());
        Ok(())
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Open an atomic output sink for `rel_path` under `location`.
pub async fn open_output_sink(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<OutputSink> {
    let target = location.resolve(rel_path);
    create_parent_dir(&target).await?;

    let tmp_path = temp_sibling(&target);
    let file = std::fs::File::create(&tmp_path).context(io_at(&tmp_path))?;
    Ok(OutputSink {
        guard: TempFileGuard::new(tmp_path.clone()),
        tmp_path,
        target,
        writer: BufWriter::new(file),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn finish_commits_contents() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("master.parquet");

        let mut sink = open_output_sink(&location, rel).await?;
        sink.write_all(b"hello ")?;
        sink.write_all(b"world")?;
        sink.finish().await?;

        assert_eq!(std::fs::read(tmp.path().join(rel))?, b"hello world");
        assert!(!tmp.path().join("master.parquet.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn drop_without_finish_discards_and_keeps_target() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("master.parquet");
        std::fs::write(tmp.path().join(rel), b"previous")?;

        {
            let mut sink = open_output_sink(&location, rel).await?;
            sink.write_all(b"partial")?;
            assert!(tmp.path().join("master.parquet.tmp").exists());
        }

        assert_eq!(std::fs::read(tmp.path().join(rel))?, b"previous");
        assert!(!tmp.path().join("master.parquet.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_write_leaves_temp_and_target_unchanged() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("coverage.json");
        std::fs::write(tmp.path().join(rel), b"{\"old\": true}")?;

        let mut sink = open_output_sink(&location, rel).await?;
        sink.write_all(b"{\"new\": ")?;
        sink.flush()?;
        // Neither finish nor drop runs, as when the process is killed.
        std::mem::forget(sink);

        assert_eq!(std::fs::read(tmp.path().join(rel))?, b"{\"old\": true}");
        assert_eq!(
            std::fs::read(tmp.path().join("coverage.json.tmp"))?,
            b"{\"new\": "
        );
        Ok(())
    }

    #[tokio::test]
    async fn sink_creates_missing_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("a/b/out.bin");

        let mut sink = open_output_sink(&location, rel).await?;
        assert_eq!(sink.target(), tmp.path().join(rel));
        sink.write_all(&[1, 2, 3])?;
        sink.finish().await?;

        assert_eq!(std::fs::read(tmp.path().join(rel))?, vec![1, 2, 3]);
        Ok(())
    }
}
