use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use crate::changeset::ChangeSet;

/// First line of every store file; guards against opening unrelated files.
pub const FILE_MAGIC: &str = "wallet-core/changeset-log/1";

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed changeset record at line {line}: {source}")]
    Record {
        line: usize,
        source: serde_json::Error,
    },

    #[error("unrecognized store header: {0:?}")]
    BadMagic(String),
}

/// Append-only changeset log.
///
/// The file holds a magic header line followed by one JSON changeset per
/// line. Loading replays every record into a single aggregate changeset; a
/// torn trailing record (interrupted write) surfaces as
/// [`StoreError::Record`] with its line number rather than being silently
/// dropped.
#[derive(Debug)]
pub struct Store {
    file: File,
}

impl Store {
    /// Create a new store file. Fails if the path already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{FILE_MAGIC}")?;
        file.sync_data()?;
        Ok(Self { file })
    }

    /// Open an existing store and replay its records.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, ChangeSet), StoreError> {
        let reader = BufReader::new(File::open(&path)?);
        let mut lines = reader.lines();

        let header = lines.next().transpose()?.unwrap_or_default();
        if header != FILE_MAGIC {
            return Err(StoreError::BadMagic(header));
        }

        let mut aggregate = ChangeSet::default();
        for (offset, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: ChangeSet = serde_json::from_str(&line).map_err(|source| {
                StoreError::Record {
                    // Line numbers are 1-based and the header is line 1.
                    line: offset + 2,
                    source,
                }
            })?;
            aggregate.merge(record);
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok((Self { file }, aggregate))
    }

    /// Open the store at `path`, creating it first if absent.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<(Self, ChangeSet), StoreError> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Ok((Self::create(path)?, ChangeSet::default()))
        }
    }

    /// Append one changeset record. Empty changesets are not written.
    pub fn append(&mut self, changeset: &ChangeSet) -> Result<(), StoreError> {
        if changeset.is_empty() {
            return Ok(());
        }
        let mut record = serde_json::to_string(changeset)
            .map_err(|source| StoreError::Record { line: 0, source })?;
        record.push('\n');
        self.file.write_all(record.as_bytes())?;
        self.file.sync_data()?;
        log::debug!("appended changeset record ({} bytes)", record.len());
        Ok(())
    }
}
