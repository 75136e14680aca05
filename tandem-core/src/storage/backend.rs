// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key/value backends underneath the typed coordinator storage.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{info, warn};

use crate::error::{Result, TandemError};

fn lock_error<T>(_: PoisonError<T>) -> TandemError {
    TandemError::storage("lock poisoned")
}

/// Table name for encrypted server shares.
pub const WALLET_SHARES_TABLE: &str = "wallet_shares";
/// Table name for custodial backup fragments.
pub const WALLET_BACKUPS_TABLE: &str = "wallet_backups";
/// Table name for durable session records.
pub const SESSIONS_TABLE: &str = "sessions";
/// Table name for per-wallet nonce counters.
pub const NONCES_TABLE: &str = "nonces";

pub const ALL_TABLES: &[&str] = &[
    WALLET_SHARES_TABLE,
    WALLET_BACKUPS_TABLE,
    SESSIONS_TABLE,
    NONCES_TABLE,
];

/// Trait for pluggable storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait StorageBackend: Send + Sync {
    /// Get a value by key from the specified table.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Store a key-value pair in the specified table.
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;
    /// Delete a key from the specified table. Returns true if the key existed.
    fn delete(&self, table: &str, key: &[u8]) -> Result<bool>;
    /// List all key-value pairs in the specified table.
    fn list(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Create a table if it doesn't exist.
    fn create_table(&self, table: &str) -> Result<()>;
}

const WALLET_SHARES_TABLE_DEF: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new(WALLET_SHARES_TABLE);
const WALLET_BACKUPS_TABLE_DEF: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new(WALLET_BACKUPS_TABLE);
const SESSIONS_TABLE_DEF: TableDefinition<&[u8], &[u8]> = TableDefinition::new(SESSIONS_TABLE);
const NONCES_TABLE_DEF: TableDefinition<&[u8], &[u8]> = TableDefinition::new(NONCES_TABLE);

/// Redb file backend.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Opens the database at `path`, creating it and its tables if needed.
    ///
    /// Retries briefly while another handle still holds the file.
    pub fn open(path: &Path) -> Result<Self> {
        const MAX_RETRIES: u32 = 10;
        const RETRY_DELAY_MS: u64 = 50;

        let mut last_err = None;
        for _ in 0..MAX_RETRIES {
            match Database::create(path) {
                Ok(db) => {
                    let backend = Self { db };
                    for table in ALL_TABLES {
                        backend.create_table(table)?;
                    }
                    info!(path = %path.display(), "coordinator store opened");
                    return Ok(backend);
                }
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    warn!(path = %path.display(), "database busy, retrying");
                    last_err = Some(redb::DatabaseError::DatabaseAlreadyOpen);
                    std::thread::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(|e| e.into())
            .unwrap_or_else(|| TandemError::storage("open failed after retries")))
    }

    fn table_def(
        &self,
        name: &str,
    ) -> Result<TableDefinition<'static, &'static [u8], &'static [u8]>> {
        match name {
            WALLET_SHARES_TABLE => Ok(WALLET_SHARES_TABLE_DEF),
            WALLET_BACKUPS_TABLE => Ok(WALLET_BACKUPS_TABLE_DEF),
            SESSIONS_TABLE => Ok(SESSIONS_TABLE_DEF),
            NONCES_TABLE => Ok(NONCES_TABLE_DEF),
            _ => Err(TandemError::storage(format!("unknown table: {name}"))),
        }
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = self.db.begin_read()?;
        let tbl = rtxn.open_table(self.table_def(table)?)?;
        Ok(tbl.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let wtxn = self.db.begin_write()?;
        wtxn.open_table(self.table_def(table)?)?
            .insert(key, value)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        let wtxn = self.db.begin_write()?;
        let existed = wtxn
            .open_table(self.table_def(table)?)?
            .remove(key)?
            .is_some();
        wtxn.commit()?;
        Ok(existed)
    }

    fn list(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtxn = self.db.begin_read()?;
        let tbl = rtxn.open_table(self.table_def(table)?)?;
        tbl.iter()?
            .map(|result| {
                let (k, v) = result?;
                Ok((k.value().to_vec(), v.value().to_vec()))
            })
            .collect()
    }

    fn create_table(&self, table: &str) -> Result<()> {
        let wtxn = self.db.begin_write()?;
        wtxn.open_table(self.table_def(table)?)?;
        wtxn.commit()?;
        Ok(())
    }
}

type TableData = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory storage backend for testing.
pub struct MemoryBackend {
    tables: RwLock<BTreeMap<String, TableData>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(lock_error)?;
        Ok(tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.tables
            .write()
            .map_err(lock_error)?
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        let mut tables = self.tables.write().map_err(lock_error)?;
        Ok(tables
            .get_mut(table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    fn list(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(lock_error)?;
        Ok(tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn create_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .map_err(lock_error)?
            .entry(table.to_string())
            .or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_backend_operations(backend: &dyn StorageBackend) {
        backend.create_table(SESSIONS_TABLE).unwrap();

        assert!(backend.get(SESSIONS_TABLE, b"key1").unwrap().is_none());

        backend.put(SESSIONS_TABLE, b"key1", b"value1").unwrap();
        assert_eq!(
            backend.get(SESSIONS_TABLE, b"key1").unwrap(),
            Some(b"value1".to_vec())
        );

        backend.put(SESSIONS_TABLE, b"key2", b"value2").unwrap();
        assert_eq!(backend.list(SESSIONS_TABLE).unwrap().len(), 2);

        assert!(backend.delete(SESSIONS_TABLE, b"key1").unwrap());
        assert!(backend.get(SESSIONS_TABLE, b"key1").unwrap().is_none());
        assert!(!backend.delete(SESSIONS_TABLE, b"key1").unwrap());
    }

    #[test]
    fn test_memory_backend() {
        test_backend_operations(&MemoryBackend::new());
    }

    #[test]
    fn test_redb_backend() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(&dir.path().join("coord.db")).unwrap();
        test_backend_operations(&backend);
    }

    #[test]
    fn test_redb_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.db");
        {
            let backend = RedbBackend::open(&path).unwrap();
            backend.put(NONCES_TABLE, b"w1", b"7").unwrap();
        }
        let backend = RedbBackend::open(&path).unwrap();
        assert_eq!(backend.get(NONCES_TABLE, b"w1").unwrap(), Some(b"7".to_vec()));
    }

    #[test]
    fn test_unknown_table_rejected() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(&dir.path().join("coord.db")).unwrap();
        assert!(backend.create_table("unknown").is_err());
    }
}
