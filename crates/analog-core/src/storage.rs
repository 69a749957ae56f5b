//! Filesystem access for the data root.
//!
//! Every read and write the pipeline performs goes through this module. Paths
//! are always given relative to a [`StorageLocation`], which keeps the layout
//! conventions (see [`crate::pipeline::DataLayout`]) separate from the I/O.
//!
//! Two write disciplines exist:
//!
//! - [`write_atomic`] and [`open_output_sink`] write to a temporary sibling
//!   and rename it over the target once the payload is durable. Readers never
//!   observe a partially written file; an aborted write leaves the previous
//!   target untouched.
//! - [`write_new`] creates a file that must not exist yet. Monthly outputs
//!   use it because their presence on disk marks a month as ingested.

use snafu::{Backtrace, prelude::*};
use std::{
    ffi::OsString,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

mod output;

pub use output::{OutputSink, open_output_sink};

/// Result of storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of a data directory.
#[derive(Clone, Debug)]
pub enum StorageLocation {
    /// A data root on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// A data root at `root` on the local filesystem.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// Absolute path of `rel_path` under this location.
    pub fn resolve(&self, rel_path: &Path) -> PathBuf {
        match self {
            StorageLocation::Local(root) => root.join(rel_path),
        }
    }
}

/// Errors from reading and writing the data root.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// A file that had to be read does not exist.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The missing path.
        path: String,
        /// The error reported by the filesystem.
        source: io::Error,
        /// Where the error was raised.
        backtrace: Backtrace,
    },

    /// A file that had to be created already exists.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The existing path.
        path: String,
        /// The error reported by the filesystem.
        source: io::Error,
        /// Where the error was raised.
        backtrace: Backtrace,
    },

    /// Any other filesystem failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    Io {
        /// The path being accessed.
        path: String,
        /// The error reported by the filesystem.
        source: io::Error,
        /// Where the error was raised.
        backtrace: Backtrace,
    },

    /// A directory the data root must contain does not exist.
    #[snafu(display("Data directory \"{path}\" does not exist"))]
    MissingDirectory {
        /// The directory that was expected.
        path: String,
    },

    /// The enriched-log directory exists but holds no monthly files.
    #[snafu(display("Directory \"{path}\" exists but contains no enriched logs"))]
    NoMonthlyFiles {
        /// The enriched-log directory.
        path: String,
    },

    /// Files for more than one domain were found where only one is allowed.
    #[snafu(display("\"{path}\" contains logs for domains {first} and {second}"))]
    SeveralDomains {
        /// The directory holding the files.
        path: String,
        /// The domain seen first.
        first: String,
        /// The conflicting domain.
        second: String,
    },

    /// No `city-YYYY-MM-DD.mmdb` file exists in the location directory.
    #[snafu(display("Directory \"{path}\" contains no geolocation database"))]
    NoLocationDatabase {
        /// The location database directory.
        path: String,
    },
}

impl StorageError {
    /// True when the error reports a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Context selector for a failed operation on `path`.
fn io_at(path: &Path) -> IoSnafu<String> {
    IoSnafu {
        path: path.display().to_string(),
    }
}

/// `NotFound` for a missing `path`, `Io` for everything else.
fn read_error(path: &Path, source: io::Error) -> StorageError {
    let path = path.display().to_string();
    if source.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            path,
            source,
            backtrace: Backtrace::capture(),
        }
    } else {
        StorageError::Io {
            path,
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

/// Temporary sibling used while a file is being replaced: `<name>.tmp`.
fn temp_sibling(abs: &Path) -> PathBuf {
    let mut name = abs
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("output"));
    name.push(".tmp");
    abs.with_file_name(name)
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    match abs.parent() {
        Some(parent) => fs::create_dir_all(parent).await.context(io_at(parent)),
        None => Ok(()),
    }
}

/// Removes a file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace the file at `rel_path` with `contents` in one atomic step.
///
/// The payload goes to `<name>.tmp` next to the target, is synced, and is
/// then renamed into place. If any step fails the temporary file is removed
/// and the target keeps its previous contents.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = temp_sibling(&abs);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    let mut file = fs::File::create(&tmp_path).await.context(io_at(&tmp_path))?;
    file.write_all(contents).await.context(io_at(&tmp_path))?;
    file.sync_all().await.context(io_at(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, &abs).await.context(io_at(&abs))?;
    guard.disarm();
    Ok(())
}

/// Create the file at `rel_path`, which must not exist yet, holding `contents`.
///
/// Fails with [`StorageError::AlreadyExists`] when the file is there already.
/// A failed write removes the partial file.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&abs).await {
        Ok(file) => file,
        Err(source) if source.kind() == io::ErrorKind::AlreadyExists => {
            return Err(source).context(AlreadyExistsSnafu {
                path: abs.display().to_string(),
            });
        }
        Err(source) => return Err(source).context(io_at(&abs)),
    };

    // A half-written monthly file would later be mistaken for a finished one.
    let mut guard = TempFileGuard::new(abs.clone());
    file.write_all(contents).await.context(io_at(&abs))?;
    file.sync_all().await.context(io_at(&abs))?;
    guard.disarm();
    Ok(())
}

/// Read the file at `rel_path` as UTF-8 text.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.resolve(rel_path);
    fs::read_to_string(&abs).await.map_err(|e| read_error(&abs, e))
}

/// Read the whole file at `rel_path`.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.resolve(rel_path);
    fs::read(&abs).await.map_err(|e| read_error(&abs, e))
}

async fn metadata(abs: &Path) -> StorageResult<Option<Metadata>> {
    match fs::metadata(abs).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(io_at(abs)),
    }
}

/// True if `rel_path` names an existing regular file.
pub async fn file_exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    let meta = metadata(&location.resolve(rel_path)).await?;
    Ok(meta.is_some_and(|m| m.is_file()))
}

/// True if `rel_path` names an existing directory.
pub async fn dir_exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    let meta = metadata(&location.resolve(rel_path)).await?;
    Ok(meta.is_some_and(|m| m.is_dir()))
}

/// Names of the regular files directly inside `rel_dir`, sorted.
///
/// Fails with [`StorageError::MissingDirectory`] when the directory does not
/// exist. Other entries are skipped.
pub async fn list_file_names(
    location: &StorageLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<String>> {
    let abs = location.resolve(rel_dir);
    let mut entries = match fs::read_dir(&abs).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return MissingDirectorySnafu {
                path: abs.display().to_string(),
            }
            .fail();
        }
        Err(e) => return Err(e).context(io_at(&abs)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.context(io_at(&abs))? {
        let file_type = entry.file_type().await.context(io_at(&entry.path()))?;
        if !file_type.is_file() {
            log::debug!("Skipping non-file entry {}", entry.path().display());
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => log::warn!("Skipping file with non-UTF-8 name {raw:?}"),
        }
    }

    names.sort();
    Ok(names)
}

/// Remove the file at `rel_path`; a file that is already gone is not an error.
pub async fn remove_file(location: &StorageLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    match fs::remove_file(&abs).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e).context(io_at(&abs)),
        _ => Ok(()),
    }
}

/// Delete `rel_dir` with everything in it and create it again, empty.
pub async fn recreate_dir(location: &StorageLocation, rel_dir: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_dir);
    if let Err(e) = fs::remove_dir_all(&abs).await {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e).context(io_at(&abs));
        }
    }
    fs::create_dir_all(&abs).await.context(io_at(&abs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_file_with_contents() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("hostnames.json");

        write_atomic(&location, rel, b"{}").await?;

        assert_eq!(std::fs::read_to_string(tmp.path().join(rel))?, "{}");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("nested/dir/file.json");

        write_atomic(&location, rel, b"[]").await?;

        assert!(tmp.path().join(rel).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_replaces_and_leaves_no_temp_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("coverage.json");

        write_atomic(&location, rel, b"old").await?;
        write_atomic(&location, rel, b"new").await?;

        assert_eq!(std::fs::read_to_string(tmp.path().join(rel))?, "new");
        assert!(!tmp.path().join("coverage.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn temp_sibling_appends_suffix_in_same_directory() {
        let tmp = temp_sibling(Path::new("/data/example.com-2023-01-2023-02.parquet"));
        assert_eq!(
            tmp,
            Path::new("/data/example.com-2023-01-2023-02.parquet.tmp")
        );
    }

    #[tokio::test]
    async fn read_to_string_returns_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let err = read_to_string(&location, Path::new("missing.json"))
            .await
            .expect_err("expected not found");
        assert!(err.is_not_found());
        assert!(snafu::ErrorCompat::backtrace(&err).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn write_new_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = Path::new("enriched-logs/example.com-2023-01.parquet");

        write_new(&location, rel, b"first").await?;
        let err = write_new(&location, rel, b"second")
            .await
            .expect_err("expected already exists");

        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert!(snafu::ErrorCompat::backtrace(&err).is_some());
        assert_eq!(std::fs::read(tmp.path().join(rel))?, b"first");
        Ok(())
    }

    #[tokio::test]
    async fn file_exists_distinguishes_files_and_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        std::fs::create_dir(tmp.path().join("dir"))?;
        std::fs::write(tmp.path().join("file"), b"x")?;

        assert!(file_exists(&location, Path::new("file")).await?);
        assert!(!file_exists(&location, Path::new("dir")).await?);
        assert!(!file_exists(&location, Path::new("nope")).await?);
        assert!(dir_exists(&location, Path::new("dir")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_file_names_is_sorted_and_skips_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        std::fs::write(tmp.path().join("b.gz"), b"")?;
        std::fs::write(tmp.path().join("a.gz"), b"")?;
        std::fs::create_dir(tmp.path().join("c.gz"))?;

        let names = list_file_names(&location, Path::new("")).await?;
        assert_eq!(names, vec!["a.gz".to_string(), "b.gz".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn list_file_names_reports_missing_directory() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let err = list_file_names(&location, Path::new("access-logs"))
            .await
            .expect_err("expected missing directory");
        assert!(matches!(err, StorageError::MissingDirectory { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn recreate_dir_empties_directory() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        std::fs::create_dir(tmp.path().join("enriched-logs"))?;
        std::fs::write(tmp.path().join("enriched-logs/x.parquet"), b"")?;

        recreate_dir(&location, Path::new("enriched-logs")).await?;

        let names = list_file_names(&location, Path::new("enriched-logs")).await?;
        assert!(names.is_empty());
        Ok(())
    }
}
