//! Durable identity store.
//!
//! The store is the only shared mutable state in the system. Callers see it
//! through [`IdentityStore`] alone: read everything, append one record, or
//! clear everything. Each backend serialises writers internally so two
//! concurrent enrollments never lose each other's record.

mod json;
mod sqlite;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IdentityRecord, LengthMismatch};

pub use json::JsonFileStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store at {location} is corrupt: {message}")]
    Corrupt { location: String, message: String },
    #[error("failed to read identity store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write identity store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    LengthMismatch(#[from] LengthMismatch),
}

/// Read-all / append-one / clear-all contract over the enrolled identities.
pub trait IdentityStore: Send + Sync {
    /// Every record in store order. An absent store reads as empty.
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Durably add one record without discarding existing ones.
    ///
    /// Rejects a descriptor whose length differs from the stored ones.
    fn append(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Durably remove every record. Succeeds on an already empty store.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Persistence backend selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl StoreBackend {
    /// File name used when no explicit store path is configured.
    pub fn default_file_name(self) -> &'static str {
        match self {
            StoreBackend::Json => "identities.json",
            StoreBackend::Sqlite => "identities.db",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StoreBackend::Json),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(format!("unknown store backend '{other}' (expected json or sqlite)")),
        }
    }
}

/// Open the configured backend at `path`.
pub fn open_store(
    backend: StoreBackend,
    path: &Path,
) -> Result<Arc<dyn IdentityStore>, StoreError> {
    let store: Arc<dyn IdentityStore> = match backend {
        StoreBackend::Json => Arc::new(JsonFileStore::new(path)),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
    };
    tracing::info!(?backend, path = %path.display(), "identity store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("json".parse::<StoreBackend>().unwrap(), StoreBackend::Json);
        assert_eq!(" SQLite ".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_open_store_both_backends() {
        let tmp = tempfile::TempDir::new().unwrap();
        for backend in [StoreBackend::Json, StoreBackend::Sqlite] {
            let path = tmp.path().join(backend.default_file_name());
            let store = open_store(backend, &path).unwrap();
            assert!(store.load_all().unwrap().is_empty());
        }
    }
}
