//! Shared fixtures for the DAG integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trustdag_core::{Hash, StorageConfig};
use trustdag_crypto::{
    Ed25519KeyPair, KeyResolutionError, KeyResolver, KeySigner, PublicKey, StaticKeyResolver,
};
use trustdag_dag::{
    DagStore, SqliteEngine, Transaction, TransactionSigner, UnsignedTransaction, VerifierPipeline,
};

pub const PAYLOAD_TYPE: &str = "application/vc+jwt";

/// Temporary SQLite database removed on drop.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("test_dag_{}.db", uuid::Uuid::new_v4())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            std::fs::remove_file(format!("{}{}", self.path.display(), suffix)).ok();
        }
    }
}

/// Resolver that counts lookups.
pub struct CountingResolver {
    inner: StaticKeyResolver,
    pub calls: AtomicUsize,
}

impl CountingResolver {
    pub fn new(inner: StaticKeyResolver) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl KeyResolver for CountingResolver {
    fn resolve_public_key(
        &self,
        key_id: &str,
        at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_public_key(key_id, at_millis)
    }
}

/// A signing identity with a resolver that knows its key.
pub struct Issuer {
    pub key: Arc<Ed25519KeyPair>,
    pub resolver: Arc<CountingResolver>,
    signer: TransactionSigner,
}

impl Issuer {
    pub fn new(seed: u8) -> Self {
        let key = Ed25519KeyPair::from_key(&[seed; 32]).expect("valid seed");
        let resolver = StaticKeyResolver::new().with_key(key.key_id(), key.public_key());
        Self {
            key: Arc::new(key),
            resolver: Arc::new(CountingResolver::new(resolver)),
            signer: TransactionSigner::new(false),
        }
    }

    pub fn pipeline(&self) -> VerifierPipeline {
        VerifierPipeline::new(self.resolver.clone())
    }

    /// Signs a transaction over `payload` with explicit parents and clock.
    pub fn sign(&self, prevs: &[&Transaction], clock: u32, payload: &[u8]) -> Transaction {
        let refs: Vec<Hash> = prevs.iter().map(|t| t.reference()).collect();
        let unsigned = UnsignedTransaction::new(Hash::sum(payload), PAYLOAD_TYPE, &refs, &[], clock)
            .expect("valid unsigned transaction");
        self.signer
            .sign(&unsigned, 1_700_000_000_000, self.key.as_ref())
            .expect("signing succeeds")
    }

    pub fn open(&self, db: &TempDb) -> DagStore<SqliteEngine> {
        let engine = SqliteEngine::open(db.path(), &StorageConfig::default())
            .expect("Failed to open SQLite engine");
        DagStore::new(engine, self.pipeline())
    }
}
