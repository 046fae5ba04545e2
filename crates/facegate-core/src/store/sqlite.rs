use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{IdentityStore, StoreError};
use crate::types::{Descriptor, IdentityRecord, LengthMismatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    name      TEXT    NOT NULL,
    vector    TEXT    NOT NULL,
    dims      INTEGER NOT NULL,
    timestamp INTEGER NOT NULL
);
";

/// Identity store backed by a single SQLite table.
///
/// Store order is insertion order (`seq`). The connection sits behind a
/// mutex, so every operation is serialised; appends additionally run in an
/// immediate transaction so the length check and the insert are atomic.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn corrupt(&self, seq: i64, message: impl std::fmt::Display) -> StoreError {
        StoreError::Corrupt {
            location: self.location.clone(),
            message: format!("row {seq}: {message}"),
        }
    }
}

impl IdentityStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT seq, name, vector, timestamp FROM identities ORDER BY seq ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, name, vector, timestamp)| -> Result<IdentityRecord, StoreError> {
                let values: Vec<f32> = serde_json::from_str(&vector)
                    .map_err(|err| self.corrupt(seq, format!("invalid vector: {err}")))?;
                let enrolled_at = DateTime::from_timestamp_millis(timestamp)
                    .ok_or_else(|| self.corrupt(seq, format!("timestamp {timestamp} out of range")))?;
                Ok(IdentityRecord {
                    name,
                    descriptor: Descriptor::new(values),
                    enrolled_at,
                })
            })
            .collect()
    }

    fn append(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&record.descriptor).map_err(|err| {
            StoreError::Corrupt {
                location: self.location.clone(),
                message: format!("descriptor not serialisable: {err}"),
            }
        })?;
        let dims = record.descriptor.len() as i64;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored_dims: Option<i64> = tx
            .query_row("SELECT dims FROM identities ORDER BY seq ASC LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(expected) = stored_dims {
            if expected != dims {
                return Err(LengthMismatch {
                    expected: expected as usize,
                    found: record.descriptor.len(),
                }
                .into());
            }
        }
        tx.execute(
            "INSERT INTO identities (name, vector, dims, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![record.name, vector, dims, record.enrolled_at.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.conn().execute("DELETE FROM identities", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(name: &str, values: &[f32]) -> IdentityRecord {
        IdentityRecord::new(name, Descriptor::new(values.to_vec()))
    }

    #[test]
    fn test_round_trip_keeps_order_and_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = record("Alice", &[0.1, -0.2, 0.3]);
        let bob = record("Bob", &[1.5, 2.5, -3.5]);
        store.append(&alice).unwrap();
        store.append(&bob).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![alice, bob]);
    }

    #[test]
    fn test_duplicate_names_are_kept() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(&record("Alice", &[0.0, 0.0])).unwrap();
        store.append(&record("Alice", &[1.0, 1.0])).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.clear().unwrap();
        store.append(&record("Alice", &[0.0])).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_length_mismatch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(&record("Alice", &[0.0, 0.0])).unwrap();
        let err = store.append(&record("Bob", &[0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::LengthMismatch(LengthMismatch { expected: 2, found: 1 })
        ));
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_vector_is_corrupt() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO identities (name, vector, dims, timestamp) VALUES ('x', 'nope', 2, 0)",
                [],
            )
            .unwrap();
        assert!(matches!(store.load_all(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("db/identities.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.append(&record("Alice", &[0.25, 0.5])).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].descriptor.values(), &[0.25, 0.5]);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(&tmp.path().join("identities.db")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.append(&record(&format!("u{i}"), &[i as f32])).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.load_all().unwrap().len(), 8);
    }
}
