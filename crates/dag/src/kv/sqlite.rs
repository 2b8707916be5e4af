//! SQLite engine.
//!
//! One table per bucket. Writes go through a single connection behind a
//! mutex; reads use a small pool of `query_only` connections, each read
//! running in its own deferred transaction, which WAL mode turns into a
//! point-in-time snapshot.

use super::{poisoned, Bucket, KvEngine, KvPair, ReadTx, WriteTx};
use crate::error::{Result, StorageError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use trustdag_core::StorageConfig;

pub struct SqliteEngine {
    path: PathBuf,
    /// `None` when opened read-only
    writer: Option<Mutex<Connection>>,
    readers: Mutex<Vec<Connection>>,
    reader_pool_size: usize,
    busy_timeout: Duration,
}

impl SqliteEngine {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        info!(path = %path.display(), "Opening SQLite DAG store");

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StorageError::from)?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let writer = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        writer.busy_timeout(busy_timeout)?;

        // WAL gives readers a stable snapshot while the writer commits
        let mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(journal_mode = %mode, "SQLite journal mode");

        Self::init_schema(&writer)?;

        Ok(Self {
            path,
            writer: Some(Mutex::new(writer)),
            readers: Mutex::new(Vec::new()),
            reader_pool_size: config.reader_pool_size,
            busy_timeout,
        })
    }

    /// Opens an existing database for inspection. Writes fail with
    /// [`StorageError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("database {} does not exist", path.display()),
            ))
            .into());
        }

        info!(path = %path.display(), "Opening SQLite DAG store read-only");

        Ok(Self {
            path,
            writer: None,
            readers: Mutex::new(Vec::new()),
            reader_pool_size: config.reader_pool_size,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        for bucket in Bucket::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key BLOB PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL
                ) WITHOUT ROWID;",
                bucket.name()
            ))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    fn checkout_reader(&self) -> Result<Connection> {
        let pooled = self
            .readers
            .lock()
            .map_err(|_| poisoned("sqlite reader pool"))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self.open_reader(),
        }
    }

    fn return_reader(&self, conn: Connection) {
        if let Ok(mut readers) = self.readers.lock() {
            if readers.len() < self.reader_pool_size {
                readers.push(conn);
            }
        }
    }
}

impl KvEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>,
    {
        let mut conn = self.checkout_reader()?;
        let result = {
            let tx = conn.transaction()?;
            let handle = SqliteTx { conn: &tx };
            f(&handle)
            // Dropping the read transaction rolls it back
        };
        self.return_reader(conn);
        result
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>,
    {
        let writer = self.writer.as_ref().ok_or(StorageError::ReadOnly)?;
        let mut conn = writer.lock().map_err(|_| poisoned("sqlite writer"))?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = {
            let mut handle = SqliteTx { conn: &tx };
            f(&mut handle)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl ReadTx for SqliteTx<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT value FROM {} WHERE key = ?1", bucket.name()))?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    fn exists(&self, bucket: Bucket, key: &[u8]) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE key = ?1)",
            bucket.name()
        ))?;
        let exists = stmt.query_row(params![key], |row| row.get::<_, bool>(0))?;
        Ok(exists)
    }

    fn scan(&self, bucket: Bucket, start: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key ASC LIMIT ?2",
            bucket.name()
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![start, limit], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self, bucket: Bucket) -> Result<u64> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT COUNT(*) FROM {}", bucket.name()))?;
        let count = stmt.query_row([], |row| row.get::<_, i64>(0))?;
        Ok(count as u64)
    }
}

impl WriteTx for SqliteTx<'_> {
    fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            bucket.name()
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("DELETE FROM {} WHERE key = ?1", bucket.name()))?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn as_read(&self) -> &dyn ReadTx {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DagError;
    use crate::kv::tests::exercise_engine;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("test_kv_{}.db", uuid::Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            std::fs::remove_file(format!("{}{}", path.display(), suffix)).ok();
        }
    }

    #[test]
    fn test_sqlite_engine_contract() {
        let db_path = temp_db();
        let engine = SqliteEngine::open(&db_path, &StorageConfig::default()).unwrap();
        assert_eq!(engine.name(), "sqlite");
        exercise_engine(&engine);
        drop(engine);
        cleanup(&db_path);
    }

    #[test]
    fn test_data_survives_reopen() {
        let db_path = temp_db();
        {
            let engine = SqliteEngine::open(&db_path, &StorageConfig::default()).unwrap();
            engine
                .write(|tx| tx.put(Bucket::Payloads, b"hash", b"bytes"))
                .unwrap();
        }

        let engine = SqliteEngine::open(&db_path, &StorageConfig::default()).unwrap();
        let value = engine.read(|tx| tx.get(Bucket::Payloads, b"hash")).unwrap();
        assert_eq!(value, Some(b"bytes".to_vec()));

        drop(engine);
        cleanup(&db_path);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let db_path = temp_db();
        {
            let engine = SqliteEngine::open(&db_path, &StorageConfig::default()).unwrap();
            engine.write(|tx| tx.put(Bucket::Heads, b"h", b"")).unwrap();
        }

        let engine = SqliteEngine::open_read_only(&db_path, &StorageConfig::default()).unwrap();
        assert_eq!(engine.read(|tx| tx.count(Bucket::Heads)).unwrap(), 1);
        let result = engine.write(|tx| tx.put(Bucket::Heads, b"x", b""));
        assert!(matches!(
            result,
            Err(DagError::Storage(StorageError::ReadOnly))
        ));

        drop(engine);
        cleanup(&db_path);
    }

    #[test]
    fn test_read_only_requires_existing_file() {
        let result = SqliteEngine::open_read_only(temp_db(), &StorageConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_reader_sees_committed_state_only() {
        let db_path = temp_db();
        let engine = SqliteEngine::open(&db_path, &StorageConfig::default()).unwrap();

        engine
            .write(|tx| {
                tx.put(Bucket::Heads, b"pending", b"")?;
                let seen = engine.read(|r| r.exists(Bucket::Heads, b"pending"))?;
                assert!(!seen);
                Ok(())
            })
            .unwrap();
        assert!(engine
            .read(|r| r.exists(Bucket::Heads, b"pending"))
            .unwrap());

        drop(engine);
        cleanup(&db_path);
    }
}
