//! Error types for the DAG store.

use crate::dispatcher::SubscriptionId;
use crate::transaction::TransactionError;
use thiserror::Error;
use trustdag_core::{CoreError, Hash};
use trustdag_crypto::KeyResolutionError;

/// Failures of the underlying key-value engine.
///
/// These are never retried by the store; the caller decides.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding an engine lock
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Store corrupted: {0}")]
    Corruption(String),

    #[error("Store opened read-only")]
    ReadOnly,
}

/// Rejections produced by the verifier pipeline.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("transaction references a non-existing previous transaction: {reference}")]
    MissingPrevious { reference: Hash },

    #[error("transaction has an invalid lamport clock value: expected {expected}, got {actual}")]
    InvalidLamportClock { expected: u32, actual: u32 },

    #[error("signature verification failed: {reason}")]
    InvalidSignature { reason: String },

    #[error("unable to resolve key {key_id}: {source}")]
    KeyResolution {
        key_id: String,
        #[source]
        source: KeyResolutionError,
    },

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Payload hash mismatch: expected {expected}, got {actual}")]
    PayloadHashMismatch { expected: Hash, actual: Hash },

    /// Rejection by a caller-supplied verifier
    #[error("{verifier}: {reason}")]
    Custom { verifier: String, reason: String },
}

/// Umbrella error of the store and its collaborators.
#[derive(Debug, Error)]
pub enum DagError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("transaction not found: {reference}")]
    TransactionNotFound { reference: Hash },

    #[error("transaction payload not yet received: {reference} (payload {payload_hash})")]
    PayloadNotReceived { reference: Hash, payload_hash: Hash },

    /// A payload arrived that no stored transaction references
    #[error("no transaction references payload {payload_hash}")]
    PayloadNotReferenced { payload_hash: Hash },

    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("operation cancelled")]
    Cancelled,

    /// A background task panicked or was aborted
    #[error("Task error: {0}")]
    Task(String),
}

impl DagError {
    /// True for rejections of the transaction itself, as opposed to
    /// infrastructure failures.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, DagError::Verification(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DagError::TransactionNotFound { .. } | DagError::PayloadNotReceived { .. }
        )
    }
}

impl From<rusqlite::Error> for DagError {
    fn from(err: rusqlite::Error) -> Self {
        DagError::Storage(StorageError::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, DagError>;
