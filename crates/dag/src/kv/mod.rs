//! Key-value engine capability.
//!
//! The store keeps all of its state in five buckets of ordered byte keys.
//! Engines provide consistent read snapshots and serialized write
//! transactions that commit only when the closure returns `Ok`.

mod memory;
mod sqlite;

pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;

use crate::error::{DagError, Result, StorageError};
use trustdag_core::{Config, StorageEngineKind};

/// Page size used by the default prefix scan.
const PREFIX_SCAN_PAGE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// ref → document
    Transactions,
    /// payload hash → payload bytes
    Payloads,
    /// ref → empty
    Heads,
    /// big-endian clock ‖ ref → empty
    ClockIndex,
    /// payload hash ‖ ref → empty
    PayloadIndex,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Transactions,
        Bucket::Payloads,
        Bucket::Heads,
        Bucket::ClockIndex,
        Bucket::PayloadIndex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Transactions => "transactions",
            Bucket::Payloads => "payloads",
            Bucket::Heads => "heads",
            Bucket::ClockIndex => "clock_index",
            Bucket::PayloadIndex => "payload_index",
        }
    }
}

pub type KvPair = (Vec<u8>, Vec<u8>);

/// Smallest key that sorts after `key`.
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Read operations of a snapshot.
pub trait ReadTx {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn exists(&self, bucket: Bucket, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    /// Up to `limit` entries with `key >= start`, in ascending key order.
    fn scan(&self, bucket: Bucket, start: &[u8], limit: usize) -> Result<Vec<KvPair>>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, bucket: Bucket, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let mut entries = Vec::new();
        let mut start = prefix.to_vec();
        loop {
            let page = self.scan(bucket, &start, PREFIX_SCAN_PAGE)?;
            let full = page.len() == PREFIX_SCAN_PAGE;
            for (key, value) in page {
                if !key.starts_with(prefix) {
                    return Ok(entries);
                }
                start = successor(&key);
                entries.push((key, value));
            }
            if !full {
                return Ok(entries);
            }
        }
    }

    fn count(&self, bucket: Bucket) -> Result<u64>;
}

/// A write transaction. Reads observe the transaction's own writes.
pub trait WriteTx: ReadTx {
    fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()>;

    fn as_read(&self) -> &dyn ReadTx;
}

/// Storage engine with single-writer, multi-reader transactions.
pub trait KvEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs `f` against a consistent point-in-time snapshot.
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>;

    /// Runs `f` in a write transaction, committed when `f` returns `Ok` and
    /// rolled back otherwise.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>;
}

/// The engine selected by `[storage] engine`.
pub enum ConfiguredEngine {
    Sqlite(SqliteEngine),
    Memory(MemoryEngine),
}

impl ConfiguredEngine {
    pub fn open(config: &Config) -> Result<Self> {
        match config.storage.engine {
            StorageEngineKind::Sqlite => Ok(ConfiguredEngine::Sqlite(SqliteEngine::open(
                config.database_path(),
                &config.storage,
            )?)),
            StorageEngineKind::Memory => Ok(ConfiguredEngine::Memory(MemoryEngine::new())),
        }
    }
}

impl KvEngine for ConfiguredEngine {
    fn name(&self) -> &'static str {
        match self {
            ConfiguredEngine::Sqlite(engine) => engine.name(),
            ConfiguredEngine::Memory(engine) => engine.name(),
        }
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>,
    {
        match self {
            ConfiguredEngine::Sqlite(engine) => engine.read(f),
            ConfiguredEngine::Memory(engine) => engine.read(f),
        }
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>,
    {
        match self {
            ConfiguredEngine::Sqlite(engine) => engine.write(f),
            ConfiguredEngine::Memory(engine) => engine.write(f),
        }
    }
}

pub(crate) fn poisoned(what: &'static str) -> DagError {
    DagError::Storage(StorageError::LockPoisoned(what))
}
