//! In-memory engine for tests and ephemeral nodes.
//!
//! Each write works on a private copy of the tables and publishes it on
//! commit, so readers always hold an immutable snapshot. Writes cost a full
//! copy, which is fine for the data sizes this engine is meant for.

use super::{poisoned, Bucket, KvEngine, KvPair, ReadTx, WriteTx};
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

type Tables = HashMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
pub struct MemoryEngine {
    state: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<Arc<Tables>> {
        let state = self.state.read().map_err(|_| poisoned("memory state"))?;
        Ok(Arc::clone(&state))
    }
}

impl KvEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>,
    {
        let snapshot = self.snapshot()?;
        f(&MemoryTx { tables: &snapshot })
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>,
    {
        let _guard = self.writer.lock().map_err(|_| poisoned("memory writer"))?;

        let mut working: Tables = (*self.snapshot()?).clone();
        let value = f(&mut MemoryWriteTx {
            tables: &mut working,
        })?;

        let mut state = self.state.write().map_err(|_| poisoned("memory state"))?;
        *state = Arc::new(working);
        Ok(value)
    }
}

fn get(tables: &Tables, bucket: Bucket, key: &[u8]) -> Option<Vec<u8>> {
    tables.get(&bucket).and_then(|t| t.get(key)).cloned()
}

fn scan(tables: &Tables, bucket: Bucket, start: &[u8], limit: usize) -> Vec<KvPair> {
    tables
        .get(&bucket)
        .map(|t| {
            t.range(start.to_vec()..)
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn count(tables: &Tables, bucket: Bucket) -> u64 {
    tables.get(&bucket).map_or(0, |t| t.len() as u64)
}

struct MemoryTx<'a> {
    tables: &'a Tables,
}

impl ReadTx for MemoryTx<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(get(self.tables, bucket, key))
    }

    fn scan(&self, bucket: Bucket, start: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        Ok(scan(self.tables, bucket, start, limit))
    }

    fn count(&self, bucket: Bucket) -> Result<u64> {
        Ok(count(self.tables, bucket))
    }
}

struct MemoryWriteTx<'a> {
    tables: &'a mut Tables,
}

impl ReadTx for MemoryWriteTx<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(get(&*self.tables, bucket, key))
    }

    fn scan(&self, bucket: Bucket, start: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        Ok(scan(&*self.tables, bucket, start, limit))
    }

    fn count(&self, bucket: Bucket) -> Result<u64> {
        Ok(count(&*self.tables, bucket))
    }
}

impl WriteTx for MemoryWriteTx<'_> {
    fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.tables
            .entry(bucket)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()> {
        if let Some(table) = self.tables.get_mut(&bucket) {
            table.remove(key);
        }
        Ok(())
    }

    fn as_read(&self) -> &dyn ReadTx {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::tests::exercise_engine;

    #[test]
    fn test_memory_engine_contract() {
        exercise_engine(&MemoryEngine::new());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let engine = MemoryEngine::new();
        engine.write(|tx| tx.put(Bucket::Heads, b"a", b"")).unwrap();

        engine
            .read(|snapshot| {
                engine.write(|tx| tx.put(Bucket::Heads, b"b", b""))?;
                assert_eq!(snapshot.count(Bucket::Heads)?, 1);
                Ok(())
            })
            .unwrap();

        assert_eq!(engine.read(|tx| tx.count(Bucket::Heads)).unwrap(), 2);
    }
}
