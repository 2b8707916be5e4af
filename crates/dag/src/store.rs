//! DAG store.
//!
//! Append-only, content-addressed storage of transactions and their
//! payloads on top of a [`KvEngine`].
//!
//! # Layout
//!
//! - `transactions`: ref → serialized document
//! - `payloads`: payload hash → payload bytes
//! - `heads`: refs of transactions without children
//! - `clock_index`: big-endian clock ‖ ref, for clock-ordered walks
//! - `payload_index`: payload hash ‖ ref, to find transactions awaiting a
//!   payload
//!
//! # Guarantees
//!
//! - A transaction is committed only after the verifier pipeline accepted it
//!   inside the same write transaction that persists it
//! - Heads change only inside that write transaction
//! - Re-adding a committed transaction is a no-op apart from merging a
//!   payload that was missing
//! - Events are handed to the dispatcher only after commit, in commit order

use crate::dispatcher::TransactionEvent;
use crate::error::{DagError, Result, StorageError, VerificationError};
use crate::kv::{successor, Bucket, KvEngine, ReadTx, WriteTx};
use crate::transaction::{ParentRef, Transaction};
use crate::verifier::{TransactionReader, VerifierPipeline};
use crate::walk::Walker;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trustdag_core::{Hash, HASH_SIZE};

/// Default number of clock index entries read per walk page.
pub const DEFAULT_WALK_PAGE_SIZE: usize = 256;

const CLOCK_SIZE: usize = 4;

/// Result of a successful [`DagStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddOutcome {
    /// The transaction was verified and committed
    Added,
    /// The transaction was already present and its missing payload was stored
    PayloadAdded,
    /// Nothing changed
    AlreadyPresent,
}

/// Store health status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreHealth {
    Ok,
    Corrupted {
        /// What the integrity check found first
        reason: String,
    },
}

impl StoreHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, StoreHealth::Ok)
    }
}

/// Observability counters for the store
#[derive(Debug, Default)]
pub struct StoreMetrics {
    transactions_added_total: AtomicU64,
    payloads_added_total: AtomicU64,
    duplicates_total: AtomicU64,
    rejections_total: AtomicU64,
    cancellations_total: AtomicU64,
    integrity_checks_total: AtomicU64,
    corruption_detections_total: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetricsSnapshot {
    pub transactions_added_total: u64,
    pub payloads_added_total: u64,
    pub duplicates_total: u64,
    pub rejections_total: u64,
    pub cancellations_total: u64,
    pub integrity_checks_total: u64,
    pub corruption_detections_total: u64,
}

impl StoreMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            transactions_added_total: self.transactions_added_total.load(Ordering::Relaxed),
            payloads_added_total: self.payloads_added_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            rejections_total: self.rejections_total.load(Ordering::Relaxed),
            cancellations_total: self.cancellations_total.load(Ordering::Relaxed),
            integrity_checks_total: self.integrity_checks_total.load(Ordering::Relaxed),
            corruption_detections_total: self.corruption_detections_total.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate numbers about the stored DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub transaction_count: u64,
    pub payload_count: u64,
    pub heads: Vec<Hash>,
    /// Highest clock among the heads, `None` for an empty store
    pub max_lamport_clock: Option<u32>,
}

pub(crate) fn clock_key(lamport_clock: u32, reference: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(CLOCK_SIZE + HASH_SIZE);
    key.extend_from_slice(&lamport_clock.to_be_bytes());
    key.extend_from_slice(reference.as_bytes());
    key
}

pub(crate) fn clock_start_key(lamport_clock: u32) -> Vec<u8> {
    lamport_clock.to_be_bytes().to_vec()
}

pub(crate) fn decode_clock_key(key: &[u8]) -> Result<(u32, Hash)> {
    if key.len() != CLOCK_SIZE + HASH_SIZE {
        return Err(corruption(format!(
            "clock index key has {} bytes",
            key.len()
        )));
    }
    let mut clock = [0u8; CLOCK_SIZE];
    clock.copy_from_slice(&key[..CLOCK_SIZE]);
    let reference = decode_hash(&key[CLOCK_SIZE..])?;
    Ok((u32::from_be_bytes(clock), reference))
}

fn payload_index_key(payload_hash: &Hash, reference: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(HASH_SIZE * 2);
    key.extend_from_slice(payload_hash.as_bytes());
    key.extend_from_slice(reference.as_bytes());
    key
}

fn decode_hash(bytes: &[u8]) -> Result<Hash> {
    Hash::from_slice(bytes).map_err(|e| corruption(e.to_string()))
}

fn corruption(reason: String) -> DagError {
    DagError::Storage(StorageError::Corruption(reason))
}

pub(crate) fn corruption_missing(index: &str, reference: &Hash) -> DagError {
    corruption(format!("{} points at missing transaction {}", index, reference))
}

/// Consistent read view handed to [`DagStore::read`] callers and verifiers.
pub struct Snapshot<'a> {
    tx: &'a dyn ReadTx,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn new(tx: &'a dyn ReadTx) -> Self {
        Self { tx }
    }

    pub fn transaction(&self, reference: &Hash) -> Result<Option<Transaction>> {
        match self.tx.get(Bucket::Transactions, reference.as_bytes())? {
            Some(data) => Transaction::parse(&data)
                .map(Some)
                .map_err(|e| corruption(format!("stored transaction {}: {}", reference, e))),
            None => Ok(None),
        }
    }

    pub fn payload(&self, payload_hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.tx.get(Bucket::Payloads, payload_hash.as_bytes())
    }

    pub fn contains(&self, reference: &Hash) -> Result<bool> {
        self.tx.exists(Bucket::Transactions, reference.as_bytes())
    }

    pub fn heads(&self) -> Result<Vec<Hash>> {
        self.tx
            .scan_prefix(Bucket::Heads, &[])?
            .into_iter()
            .map(|(key, _)| decode_hash(&key))
            .collect()
    }

    /// Refs of all transactions that carry `payload_hash`.
    pub fn references_for_payload(&self, payload_hash: &Hash) -> Result<Vec<Hash>> {
        self.tx
            .scan_prefix(Bucket::PayloadIndex, payload_hash.as_bytes())?
            .into_iter()
            .map(|(key, _)| decode_hash(&key[HASH_SIZE..]))
            .collect()
    }

    pub fn transaction_count(&self) -> Result<u64> {
        self.tx.count(Bucket::Transactions)
    }

    pub fn payload_count(&self) -> Result<u64> {
        self.tx.count(Bucket::Payloads)
    }
}

impl TransactionReader for Snapshot<'_> {
    fn get_transaction(&self, reference: &Hash) -> Result<Option<Transaction>> {
        self.transaction(reference)
    }

    fn is_present(&self, reference: &Hash) -> Result<bool> {
        self.contains(reference)
    }
}

/// The transaction DAG store.
pub struct DagStore<E: KvEngine> {
    engine: E,
    pipeline: VerifierPipeline,
    events: Option<mpsc::UnboundedSender<TransactionEvent>>,
    walk_page_size: usize,
    health: RwLock<StoreHealth>,
    metrics: StoreMetrics,
    /// Held from write to publish so events leave in commit order
    commit_order: Mutex<()>,
}

impl<E: KvEngine> DagStore<E> {
    pub fn new(engine: E, pipeline: VerifierPipeline) -> Self {
        info!(
            engine = engine.name(),
            verifiers = ?pipeline.names(),
            "Opening DAG store"
        );
        Self {
            engine,
            pipeline,
            events: None,
            walk_page_size: DEFAULT_WALK_PAGE_SIZE,
            health: RwLock::new(StoreHealth::Ok),
            metrics: StoreMetrics::default(),
            commit_order: Mutex::new(()),
        }
    }

    /// Hands events for committed transactions to `sender` (the dispatcher).
    pub fn with_event_sink(mut self, sender: mpsc::UnboundedSender<TransactionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn with_walk_page_size(mut self, page_size: usize) -> Self {
        self.walk_page_size = page_size.max(1);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn pipeline(&self) -> &VerifierPipeline {
        &self.pipeline
    }

    pub(crate) fn walk_page_size(&self) -> usize {
        self.walk_page_size
    }

    /// Verifies and commits a transaction, optionally with its payload.
    ///
    /// The payload, when given, must hash to the transaction's payload hash;
    /// otherwise nothing is written. Cancelling `cancel` before commit rolls
    /// the write back.
    pub fn add(
        &self,
        cancel: &CancellationToken,
        transaction: &Transaction,
        payload: Option<&[u8]>,
    ) -> Result<AddOutcome> {
        if cancel.is_cancelled() {
            StoreMetrics::incr(&self.metrics.cancellations_total);
            return Err(DagError::Cancelled);
        }
        self.ensure_healthy()?;

        let reference = transaction.reference();
        let payload_hash = transaction.payload_hash();

        if let Some(payload) = payload {
            let actual = Hash::sum(payload);
            if actual != payload_hash {
                StoreMetrics::incr(&self.metrics.rejections_total);
                warn!(
                    reference = %reference,
                    expected = %payload_hash,
                    actual = %actual,
                    "Rejected transaction: payload hash mismatch"
                );
                return Err(VerificationError::PayloadHashMismatch {
                    expected: payload_hash,
                    actual,
                }
                .into());
            }
        }

        let _ordered = self
            .commit_order
            .lock()
            .map_err(|_| DagError::Storage(StorageError::LockPoisoned("store commit order")))?;
        let result = self.engine.write(|wtx| {
            if wtx.exists(Bucket::Transactions, reference.as_bytes())? {
                return match payload {
                    Some(payload) if !wtx.exists(Bucket::Payloads, payload_hash.as_bytes())? => {
                        let events = merge_payload(wtx, &payload_hash, payload)?;
                        Ok((AddOutcome::PayloadAdded, events))
                    }
                    _ => Ok((AddOutcome::AlreadyPresent, Vec::new())),
                };
            }

            self.pipeline
                .verify(&Snapshot::new(wtx.as_read()), transaction)?;

            if cancel.is_cancelled() {
                return Err(DagError::Cancelled);
            }

            wtx.put(Bucket::Transactions, reference.as_bytes(), transaction.data())?;
            wtx.put(
                Bucket::ClockIndex,
                &clock_key(transaction.lamport_clock(), &reference),
                &[],
            )?;
            wtx.put(
                Bucket::PayloadIndex,
                &payload_index_key(&payload_hash, &reference),
                &[],
            )?;
            for prev in transaction.prevs() {
                wtx.delete(Bucket::Heads, prev.as_bytes())?;
            }
            wtx.put(Bucket::Heads, reference.as_bytes(), &[])?;

            let available: Option<Arc<[u8]>> = match payload {
                Some(payload) => {
                    if !wtx.exists(Bucket::Payloads, payload_hash.as_bytes())? {
                        wtx.put(Bucket::Payloads, payload_hash.as_bytes(), payload)?;
                    }
                    Some(Arc::from(payload))
                }
                None => wtx
                    .get(Bucket::Payloads, payload_hash.as_bytes())?
                    .map(Arc::from),
            };

            let events: Vec<TransactionEvent> = available
                .map(|payload| TransactionEvent {
                    transaction: transaction.clone(),
                    payload,
                })
                .into_iter()
                .collect();
            Ok((AddOutcome::Added, events))
        });

        let (outcome, events) = match result {
            Ok(committed) => committed,
            Err(DagError::Cancelled) => {
                StoreMetrics::incr(&self.metrics.cancellations_total);
                debug!(reference = %reference, "Add cancelled before commit");
                return Err(DagError::Cancelled);
            }
            Err(e) => {
                if e.is_verification_failure() {
                    StoreMetrics::incr(&self.metrics.rejections_total);
                    warn!(reference = %reference, error = %e, "Rejected transaction");
                } else {
                    error!(reference = %reference, error = %e, "Failed to add transaction");
                }
                return Err(e);
            }
        };

        match outcome {
            AddOutcome::Added => {
                StoreMetrics::incr(&self.metrics.transactions_added_total);
                debug!(
                    reference = %reference,
                    payload_type = %transaction.payload_type(),
                    lamport_clock = transaction.lamport_clock(),
                    has_payload = !events.is_empty(),
                    "Transaction committed"
                );
            }
            AddOutcome::PayloadAdded => {
                StoreMetrics::incr(&self.metrics.payloads_added_total);
                debug!(reference = %reference, payload_hash = %payload_hash, "Payload merged");
            }
            AddOutcome::AlreadyPresent => {
                StoreMetrics::incr(&self.metrics.duplicates_total);
                debug!(reference = %reference, "Transaction already present");
            }
        }

        self.publish(events);
        Ok(outcome)
    }

    /// Parses a serialized transaction and adds it.
    pub fn add_serialized(
        &self,
        cancel: &CancellationToken,
        data: &[u8],
        payload: Option<&[u8]>,
    ) -> Result<(Transaction, AddOutcome)> {
        let transaction = Transaction::parse(data).map_err(|e| {
            StoreMetrics::incr(&self.metrics.rejections_total);
            warn!(error = %e, "Rejected unparseable transaction");
            DagError::from(e)
        })?;
        let outcome = self.add(cancel, &transaction, payload)?;
        Ok((transaction, outcome))
    }

    /// Stores a payload that arrived after its transaction.
    ///
    /// Returns [`AddOutcome::PayloadAdded`] when it was new and
    /// [`AddOutcome::AlreadyPresent`] otherwise.
    pub fn write_payload(&self, payload_hash: &Hash, payload: &[u8]) -> Result<AddOutcome> {
        self.ensure_healthy()?;

        let actual = Hash::sum(payload);
        if actual != *payload_hash {
            StoreMetrics::incr(&self.metrics.rejections_total);
            warn!(expected = %payload_hash, actual = %actual, "Rejected payload: hash mismatch");
            return Err(VerificationError::PayloadHashMismatch {
                expected: *payload_hash,
                actual,
            }
            .into());
        }

        let _ordered = self
            .commit_order
            .lock()
            .map_err(|_| DagError::Storage(StorageError::LockPoisoned("store commit order")))?;
        let (outcome, events) = self.engine.write(|wtx| {
            if wtx.exists(Bucket::Payloads, payload_hash.as_bytes())? {
                return Ok((AddOutcome::AlreadyPresent, Vec::new()));
            }
            let events = merge_payload(wtx, payload_hash, payload)?;
            if events.is_empty() {
                return Err(DagError::PayloadNotReferenced {
                    payload_hash: *payload_hash,
                });
            }
            Ok((AddOutcome::PayloadAdded, events))
        })?;

        if outcome == AddOutcome::PayloadAdded {
            StoreMetrics::incr(&self.metrics.payloads_added_total);
            debug!(
                payload_hash = %payload_hash,
                transactions = events.len(),
                "Payload merged"
            );
        }
        self.publish(events);
        Ok(outcome)
    }

    pub fn get_transaction(&self, reference: &Hash) -> Result<Transaction> {
        self.read(|snapshot| {
            snapshot
                .transaction(reference)?
                .ok_or(DagError::TransactionNotFound {
                    reference: *reference,
                })
        })
    }

    /// Payload of the transaction `reference`.
    pub fn get_payload(&self, reference: &Hash) -> Result<Vec<u8>> {
        self.read(|snapshot| {
            let transaction =
                snapshot
                    .transaction(reference)?
                    .ok_or(DagError::TransactionNotFound {
                        reference: *reference,
                    })?;
            let payload_hash = transaction.payload_hash();
            snapshot
                .payload(&payload_hash)?
                .ok_or(DagError::PayloadNotReceived {
                    reference: *reference,
                    payload_hash,
                })
        })
    }

    /// Runs `f` against a consistent snapshot of the store.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Snapshot<'_>) -> Result<T>,
    {
        self.engine.read(|tx| f(&Snapshot::new(tx)))
    }

    /// Visits committed transactions in clock order, starting at
    /// `start_clock`. The visitor returns `false` to stop early.
    ///
    /// Returns the number of transactions visited.
    pub fn walk<F>(
        &self,
        start_clock: u32,
        cancel: &CancellationToken,
        mut visitor: F,
    ) -> Result<usize>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let mut visited = 0;
        for transaction in self.walker(start_clock) {
            if cancel.is_cancelled() {
                return Err(DagError::Cancelled);
            }
            let transaction = transaction?;
            visited += 1;
            if !visitor(&transaction) {
                break;
            }
        }
        Ok(visited)
    }

    /// Lazy, paged iterator over committed transactions in clock order.
    pub fn walker(&self, start_clock: u32) -> Walker<'_, E> {
        Walker::new(self, start_clock)
    }

    pub fn heads(&self) -> Result<Vec<Hash>> {
        self.read(|snapshot| snapshot.heads())
    }

    /// Current heads with their clocks, the natural parents of a new local
    /// transaction.
    pub fn head_parents(&self) -> Result<Vec<ParentRef>> {
        self.read(|snapshot| {
            let mut parents = Vec::new();
            for reference in snapshot.heads()? {
                let transaction = snapshot
                    .transaction(&reference)?
                    .ok_or_else(|| corruption_missing("head", &reference))?;
                parents.push(ParentRef {
                    reference,
                    lamport_clock: transaction.lamport_clock(),
                });
            }
            Ok(parents)
        })
    }

    pub fn is_present(&self, reference: &Hash) -> Result<bool> {
        self.read(|snapshot| snapshot.contains(reference))
    }

    pub fn transaction_count(&self) -> Result<u64> {
        self.read(|snapshot| snapshot.transaction_count())
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let parents = self.head_parents()?;
        let (transaction_count, payload_count) = self.read(|snapshot| {
            Ok((snapshot.transaction_count()?, snapshot.payload_count()?))
        })?;
        Ok(StoreStatistics {
            transaction_count,
            payload_count,
            max_lamport_clock: parents.iter().map(|p| p.lamport_clock).max(),
            heads: parents.into_iter().map(|p| p.reference).collect(),
        })
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> StoreHealth {
        self.health
            .read()
            .map(|health| health.clone())
            .unwrap_or_else(|_| StoreHealth::Corrupted {
                reason: "health lock poisoned".to_string(),
            })
    }

    /// Read-only consistency check of the whole store.
    ///
    /// Checks that every stored document hashes to its key, parses and is
    /// indexed; that every index entry and head points at a stored
    /// transaction; and that every payload hashes to its key. The first
    /// problem found marks the store corrupted, after which `add` refuses to
    /// write.
    pub fn integrity_check(&self) -> Result<StoreHealth> {
        StoreMetrics::incr(&self.metrics.integrity_checks_total);
        info!(engine = self.engine.name(), "Starting store integrity check");

        let (problem, checked) = self.engine.read(|tx| {
            let mut checked = 0u64;
            let problem = find_inconsistency(tx, self.walk_page_size, &mut checked)?;
            Ok((problem, checked))
        })?;

        let health = match problem {
            None => {
                info!(transactions = checked, "Store integrity check passed");
                StoreHealth::Ok
            }
            Some(reason) => {
                StoreMetrics::incr(&self.metrics.corruption_detections_total);
                error!(reason = %reason, "Store corruption detected");
                StoreHealth::Corrupted { reason }
            }
        };

        let mut current = self
            .health
            .write()
            .map_err(|_| DagError::Storage(StorageError::LockPoisoned("store health")))?;
        *current = health.clone();
        Ok(health)
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.health() {
            StoreHealth::Ok => Ok(()),
            StoreHealth::Corrupted { reason } => {
                warn!(reason = %reason, "Attempted to write to corrupted store");
                Err(corruption(format!("cannot write to corrupted store: {}", reason)))
            }
        }
    }

    fn publish(&self, events: Vec<TransactionEvent>) {
        let Some(sender) = &self.events else {
            return;
        };
        for event in events {
            if sender.send(event).is_err() {
                warn!("Event dispatcher stopped; dropping transaction event");
                return;
            }
        }
    }
}

/// Stores a payload and builds an event for every transaction carrying it.
fn merge_payload(
    wtx: &mut dyn WriteTx,
    payload_hash: &Hash,
    payload: &[u8],
) -> Result<Vec<TransactionEvent>> {
    let snapshot = Snapshot::new(wtx.as_read());
    let references = snapshot.references_for_payload(payload_hash)?;
    let shared: Arc<[u8]> = Arc::from(payload);

    let mut events = Vec::with_capacity(references.len());
    for reference in references {
        let transaction = snapshot
            .transaction(&reference)?
            .ok_or_else(|| corruption_missing("payload index", &reference))?;
        events.push(TransactionEvent {
            transaction,
            payload: Arc::clone(&shared),
        });
    }

    if !events.is_empty() {
        wtx.put(Bucket::Payloads, payload_hash.as_bytes(), payload)?;
    }
    Ok(events)
}

/// Calls `f` for every entry of `bucket`, one page at a time.
fn for_each_entry<F>(
    tx: &dyn ReadTx,
    bucket: Bucket,
    page_size: usize,
    mut f: F,
) -> Result<Option<String>>
where
    F: FnMut(&[u8], &[u8]) -> Result<Option<String>>,
{
    let mut start = Vec::new();
    loop {
        let page = tx.scan(bucket, &start, page_size)?;
        let full = page.len() == page_size;
        for (key, value) in &page {
            if let Some(problem) = f(key, value)? {
                return Ok(Some(problem));
            }
        }
        match page.last() {
            Some((key, _)) if full => start = successor(key),
            _ => return Ok(None),
        }
    }
}

fn find_inconsistency(
    tx: &dyn ReadTx,
    page_size: usize,
    checked: &mut u64,
) -> Result<Option<String>> {
    let problem = for_each_entry(tx, Bucket::Transactions, page_size, |key, value| {
        *checked += 1;
        let Ok(reference) = Hash::from_slice(key) else {
            return Ok(Some(format!("transaction key of {} bytes", key.len())));
        };
        if Hash::sum(value) != reference {
            return Ok(Some(format!("transaction {} does not match its hash", reference)));
        }
        let transaction = match Transaction::parse(value) {
            Ok(transaction) => transaction,
            Err(e) => {
                return Ok(Some(format!(
                    "transaction {} does not parse: {}",
                    reference, e
                )))
            }
        };
        if !tx.exists(Bucket::ClockIndex, &clock_key(transaction.lamport_clock(), &reference))? {
            return Ok(Some(format!("transaction {} missing from clock index", reference)));
        }
        let payload_key = payload_index_key(&transaction.payload_hash(), &reference);
        if !tx.exists(Bucket::PayloadIndex, &payload_key)? {
            return Ok(Some(format!("transaction {} missing from payload index", reference)));
        }
        Ok(None)
    })?;
    if problem.is_some() {
        return Ok(problem);
    }

    let problem = for_each_entry(tx, Bucket::ClockIndex, page_size, |key, _| {
        let (clock, reference) = match decode_clock_key(key) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(Some(e.to_string())),
        };
        match tx.get(Bucket::Transactions, reference.as_bytes())? {
            None => Ok(Some(format!("clock index points at missing {}", reference))),
            Some(data) => match Transaction::parse(&data) {
                Ok(t) if t.lamport_clock() == clock => Ok(None),
                _ => Ok(Some(format!("clock index entry {} for {} is wrong", clock, reference))),
            },
        }
    })?;
    if problem.is_some() {
        return Ok(problem);
    }

    let problem = for_each_entry(tx, Bucket::PayloadIndex, page_size, |key, _| {
        if key.len() != HASH_SIZE * 2 {
            return Ok(Some(format!("payload index key of {} bytes", key.len())));
        }
        if !tx.exists(Bucket::Transactions, &key[HASH_SIZE..])? {
            return Ok(Some(format!(
                "payload index points at missing {}",
                hex::encode(&key[HASH_SIZE..])
            )));
        }
        Ok(None)
    })?;
    if problem.is_some() {
        return Ok(problem);
    }

    let problem = for_each_entry(tx, Bucket::Heads, page_size, |key, _| {
        if !tx.exists(Bucket::Transactions, key)? {
            return Ok(Some(format!("head {} has no transaction", hex::encode(key))));
        }
        Ok(None)
    })?;
    if problem.is_some() {
        return Ok(problem);
    }
    if *checked > 0 && tx.count(Bucket::Heads)? == 0 {
        return Ok(Some("non-empty store without heads".to_string()));
    }

    for_each_entry(tx, Bucket::Payloads, page_size, |key, value| {
        if Hash::sum(value).as_bytes().as_slice() != key {
            return Ok(Some(format!("payload {} does not match its hash", hex::encode(key))));
        }
        Ok(None)
    })
}
