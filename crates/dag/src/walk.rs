//! Clock-ordered traversal of the DAG.
//!
//! The walker reads the clock index one page at a time, each page from a
//! fresh snapshot, so a long walk never pins a snapshot or holds the whole
//! DAG in memory. Entries are ordered by clock, ties by ref. The cursor only
//! moves forward, so every transaction is yielded at most once; transactions
//! committed during the walk are yielded if they sort after the cursor.

use crate::error::Result;
use crate::kv::{successor, Bucket, KvEngine};
use crate::store::{clock_start_key, corruption_missing, decode_clock_key, DagStore, Snapshot};
use crate::transaction::Transaction;
use std::collections::VecDeque;

/// Lazy iterator returned by [`DagStore::walker`].
pub struct Walker<'a, E: KvEngine> {
    store: &'a DagStore<E>,
    cursor: Vec<u8>,
    buffer: VecDeque<Transaction>,
    done: bool,
}

impl<'a, E: KvEngine> Walker<'a, E> {
    pub(crate) fn new(store: &'a DagStore<E>, start_clock: u32) -> Self {
        Self {
            store,
            cursor: clock_start_key(start_clock),
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let page_size = self.store.walk_page_size();
        let cursor = &self.cursor;

        let (transactions, last_key) = self.store.engine().read(|tx| {
            let entries = tx.scan(Bucket::ClockIndex, cursor, page_size)?;
            let snapshot = Snapshot::new(tx);

            let mut transactions = Vec::with_capacity(entries.len());
            for (key, _) in &entries {
                let (_, reference) = decode_clock_key(key)?;
                let transaction = snapshot
                    .transaction(&reference)?
                    .ok_or_else(|| corruption_missing("clock index", &reference))?;
                transactions.push(transaction);
            }
            Ok((transactions, entries.last().map(|(key, _)| key.clone())))
        })?;

        if transactions.len() < page_size {
            self.done = true;
        }
        if let Some(key) = last_key {
            self.cursor = successor(&key);
        }
        self.buffer.extend(transactions);
        Ok(())
    }
}

impl<E: KvEngine> Iterator for Walker<'_, E> {
    type Item = Result<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(transaction) = self.buffer.pop_front() {
                return Some(Ok(transaction));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
