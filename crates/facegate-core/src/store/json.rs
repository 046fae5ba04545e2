use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tempfile::NamedTempFile;

use super::{IdentityStore, StoreError};
use crate::types::IdentityRecord;

/// Identity store kept as a single JSON array of
/// `{name, vector, timestamp}` objects.
///
/// Appends are read-modify-write under an exclusive lock, and every write
/// replaces the file atomically via a fsynced temporary file in the same
/// directory. Loads share a read lock and so always see a whole file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&data).map_err(|err| StoreError::Corrupt {
            location: self.path.display().to_string(),
            message: format!("invalid identity store contents: {err}"),
        })
    }

    fn write_records(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
        {
            let file = tmp.as_file_mut();
            let mut writer = BufWriter::new(&mut *file);
            serde_json::to_writer_pretty(&mut writer, records)
                .map_err(|err| write_err(err.into()))?;
            writer.write_all(b"\n").map_err(write_err)?;
            writer.flush().map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

impl IdentityStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        // The lock guards no data, so a poisoned lock is still usable.
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.read_records()
    }

    fn append(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut records = self.read_records()?;
        if let Some(first) = records.first() {
            first.descriptor.ensure_same_len(&record.descriptor)?;
        }
        records.push(record.clone());
        self.write_records(&records)?;
        tracing::debug!(
            path = %self.path.display(),
            count = records.len(),
            "identity store written"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
