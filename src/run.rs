//! Sorted runs stored on the file system.
//!
//! Every intermediate artifact lives in a temporary root directory owned by a [`RunStore`]. Artifact names start
//! with [`TEMP_PREFIX`] so stale files left by an interrupted process can be recognized and reclaimed by an
//! external housekeeping sweep.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log;
use tempfile;

use crate::record::{Dialect, Record, RecordError, RecordReader, RecordWriter};
use crate::sort::SortError;

/// Name prefix reserved for temporary artifacts.
pub const TEMP_PREFIX: &str = "temp";

const RUN_PREFIX: &str = "temp_run_";
const RUN_SUFFIX: &str = ".csv";

/// Handle of a sorted run persisted on disk.
///
/// A run is immutable once sealed. Dropping the handle without retiring or publishing it deletes the run file.
pub struct Run {
    id: u64,
    path: tempfile::TempPath,
    records: u64,
}

impl Run {
    /// Returns run unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns run file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns number of records in the run.
    pub fn len(&self) -> u64 {
        self.records
    }

    /// Deletes the run file. Called once the run has been fully consumed.
    pub fn retire(self) -> Result<(), SortError> {
        log::trace!("retiring run {}", self.id);
        self.path.close().map_err(SortError::IO)
    }

    /// Moves the run to `output` replacing any existing file. An existing output keeps its permissions.
    ///
    /// The run file is renamed if possible. Otherwise (for example if the temporary directory is located on
    /// another file system) its content is copied to a temporary file next to the output which then gets renamed.
    pub fn publish(self, output: &Path) -> Result<(), SortError> {
        let id = self.id;
        if let Some(permissions) = output_permissions(output) {
            fs::set_permissions(&self.path, permissions).map_err(SortError::Output)?;
        }

        let err = match self.path.persist(output) {
            Ok(()) => {
                log::debug!("run {} published as {}", id, output.display());
                return Ok(());
            }
            Err(err) => err,
        };

        log::debug!("run {} can't be renamed ({}), copying it to {}", id, err.error, output.display());
        copy_to_output(&err.path, output)?;

        return err.path.close().map_err(SortError::IO);
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("records", &self.records)
            .finish()
    }
}

/// Creates an empty file at `output` replacing any existing file.
pub fn publish_empty(output: &Path) -> Result<(), SortError> {
    let target = create_output_tmp(output)?;
    target.persist(output).map_err(|err| SortError::Output(err.error))?;
    log::debug!("empty output published as {}", output.display());

    return Ok(());
}

/// Copies `source` to `output` through a temporary file renamed into place.
fn copy_to_output(source: &Path, output: &Path) -> Result<(), SortError> {
    let mut target = create_output_tmp(output)?;
    let mut source = fs::File::open(source).map_err(SortError::Output)?;
    io::copy(&mut source, &mut target).map_err(SortError::Output)?;
    target.persist(output).map_err(|err| SortError::Output(err.error))?;

    return Ok(());
}

fn create_output_tmp(output: &Path) -> Result<tempfile::NamedTempFile, SortError> {
    let output_dir = output
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let target = new_file_builder(TEMP_PREFIX, "")
        .tempfile_in(output_dir)
        .map_err(SortError::Output)?;

    if let Some(permissions) = output_permissions(output) {
        target.as_file().set_permissions(permissions).map_err(SortError::Output)?;
    }

    return Ok(target);
}

/// Permissions of the file currently at `output`, if any.
fn output_permissions(output: &Path) -> Option<fs::Permissions> {
    fs::metadata(output)
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.permissions())
}

/// Builder of files that get the same default mode as any file created by the process.
/// Runs are published by rename, so they are created that way too.
fn new_file_builder<'a, 'b>(prefix: &'a str, suffix: &'b str) -> tempfile::Builder<'a, 'b> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(suffix);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // narrowed by the umask on creation
        builder.permissions(fs::Permissions::from_mode(0o666));
    }

    return builder;
}

/// Run storage. Owns the temporary root directory and allocates run identifiers.
pub struct RunStore {
    dir: tempfile::TempDir,
    next_id: AtomicU64,
    dialect: Dialect,
    rw_buf_size: Option<usize>,
}

impl RunStore {
    /// Creates a run store.
    ///
    /// # Arguments
    /// * `tmp_path` - Directory the temporary root is created in. If the parameter is [`None`] default OS temporary
    ///   directory will be used.
    /// * `dialect` - Record encoding of run files.
    /// * `rw_buf_size` - Run files read/write buffer size.
    pub fn new(tmp_path: Option<&Path>, dialect: Dialect, rw_buf_size: Option<usize>) -> Result<Self, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);

        let dir = if let Some(tmp_path) = tmp_path {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a temporary directory", dir.path().display());

        return Ok(RunStore {
            dir,
            next_id: AtomicU64::new(0),
            dialect,
            rw_buf_size,
        });
    }

    /// Returns the temporary root directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the record encoding of run files.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Creates a new empty run writer with a unique identifier.
    pub fn create(&self) -> Result<RunWriter, SortError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("{}{}_", RUN_PREFIX, id);
        let file = new_file_builder(&prefix, RUN_SUFFIX)
            .tempfile_in(self.dir.path())
            .map_err(SortError::RunWrite)?;

        return Ok(RunWriter {
            id,
            writer: self.dialect.writer(file, self.rw_buf_size),
            records: 0,
        });
    }

    /// Writes already sorted items to a new run.
    pub fn spill(&self, items: impl IntoIterator<Item = Record>) -> Result<Run, SortError> {
        let mut writer = self.create()?;
        for item in items {
            writer.push(&item)?;
        }

        return writer.finish();
    }

    /// Opens a read cursor over the run records.
    pub fn open(&self, run: &Run) -> Result<RunCursor, SortError> {
        let file = fs::File::open(run.path()).map_err(|err| SortError::RunRead {
            path: run.path().to_path_buf(),
            record: 0,
            source: RecordError::IO(err),
        })?;

        return Ok(RunCursor {
            path: run.path().to_path_buf(),
            reader: self.dialect.reader(file, self.rw_buf_size),
        });
    }
}

/// Writer of a run being created. The partially written file is deleted if the writer is dropped.
pub struct RunWriter {
    id: u64,
    writer: RecordWriter<tempfile::NamedTempFile>,
    records: u64,
}

impl RunWriter {
    /// Appends a record. Records must be pushed in key order.
    pub fn push(&mut self, record: &Record) -> Result<(), SortError> {
        self.writer.write(record).map_err(SortError::RunWrite)?;
        self.records += 1;

        return Ok(());
    }

    /// Seals the run. Empty runs are rejected.
    pub fn finish(self) -> Result<Run, SortError> {
        if self.records == 0 {
            return Err(SortError::RunWrite(io::Error::new(
                io::ErrorKind::InvalidInput,
                "run contains no records",
            )));
        }

        let file = self.writer.into_inner().map_err(SortError::RunWrite)?;
        let run = Run {
            id: self.id,
            path: file.into_temp_path(),
            records: self.records,
        };
        log::debug!("run {} sealed ({} records)", run.id, run.records);

        return Ok(run);
    }
}

/// Sequential read cursor over run records.
pub struct RunCursor {
    path: PathBuf,
    reader: RecordReader<fs::File>,
}

impl Iterator for RunCursor {
    type Item = Result<Record, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_next() {
            Ok(record) => record.map(Ok),
            Err(err) => Some(Err(SortError::RunRead {
                path: self.path.clone(),
                record: self.reader.records_read() + 1,
                source: err,
            })),
        }
    }
}
