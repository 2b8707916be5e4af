//! Verifier pipeline.
//!
//! Every transaction passes an ordered list of verifiers before it is
//! committed. The pipeline runs inside the store's write transaction and
//! stops at the first rejection. Verifiers only read.

use crate::error::{DagError, VerificationError};
use crate::transaction::{next_lamport_clock, SigningKeyRef, Transaction};
use std::sync::Arc;
use tracing::debug;
use trustdag_core::Hash;
use trustdag_crypto::{KeyResolver, PublicKey};

/// Read access to committed transactions, as seen by verifiers.
pub trait TransactionReader {
    fn get_transaction(&self, reference: &Hash) -> Result<Option<Transaction>, DagError>;

    fn is_present(&self, reference: &Hash) -> Result<bool, DagError>;
}

/// A single acceptance rule.
pub trait Verifier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn verify(&self, reader: &dyn TransactionReader, transaction: &Transaction)
        -> Result<(), DagError>;
}

/// Every previous transaction must already be committed.
#[derive(Debug, Default)]
pub struct AncestryVerifier;

impl Verifier for AncestryVerifier {
    fn name(&self) -> &str {
        "ancestry"
    }

    fn verify(
        &self,
        reader: &dyn TransactionReader,
        transaction: &Transaction,
    ) -> Result<(), DagError> {
        for prev in transaction.prevs() {
            if !reader.is_present(prev)? {
                return Err(VerificationError::MissingPrevious { reference: *prev }.into());
            }
        }
        Ok(())
    }
}

/// The clock must be one more than the highest parent clock, or 0 for a
/// root.
#[derive(Debug, Default)]
pub struct LamportClockVerifier;

impl Verifier for LamportClockVerifier {
    fn name(&self) -> &str {
        "lamport_clock"
    }

    fn verify(
        &self,
        reader: &dyn TransactionReader,
        transaction: &Transaction,
    ) -> Result<(), DagError> {
        let mut parent_clocks = Vec::with_capacity(transaction.prevs().len());
        for prev in transaction.prevs() {
            let parent = reader
                .get_transaction(prev)?
                .ok_or(VerificationError::MissingPrevious { reference: *prev })?;
            parent_clocks.push(parent.lamport_clock());
        }

        let actual = transaction.lamport_clock();
        let expected = next_lamport_clock(parent_clocks).map_err(|_| {
            VerificationError::InvalidLamportClock {
                expected: u32::MAX,
                actual,
            }
        })?;
        if expected != actual {
            return Err(VerificationError::InvalidLamportClock { expected, actual }.into());
        }
        Ok(())
    }
}

/// Checks the signature against the embedded key, or the key resolved by ID
/// as of the transaction's signing time.
pub struct SignatureVerifier {
    resolver: Arc<dyn KeyResolver>,
}

impl SignatureVerifier {
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    fn public_key(&self, transaction: &Transaction) -> Result<PublicKey, VerificationError> {
        match transaction.signing_key() {
            SigningKeyRef::Embedded(key) => Ok(key.clone()),
            SigningKeyRef::ById(key_id) => self
                .resolver
                .resolve_public_key(key_id, transaction.signing_time())
                .map_err(|source| VerificationError::KeyResolution {
                    key_id: key_id.clone(),
                    source,
                }),
        }
    }
}

impl Verifier for SignatureVerifier {
    fn name(&self) -> &str {
        "signature"
    }

    fn verify(
        &self,
        _reader: &dyn TransactionReader,
        transaction: &Transaction,
    ) -> Result<(), DagError> {
        let algorithm = transaction.algorithm();
        if !algorithm.is_accepted() {
            return Err(VerificationError::UnsupportedAlgorithm(algorithm.to_string()).into());
        }

        let key = self.public_key(transaction)?;
        key.verify(transaction.signing_input(), transaction.signature())
            .map_err(|e| VerificationError::InvalidSignature {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Ordered, fail-fast list of verifiers.
#[derive(Clone)]
pub struct VerifierPipeline {
    verifiers: Vec<Arc<dyn Verifier>>,
}

impl VerifierPipeline {
    /// The built-in rules: ancestry, Lamport clock, then signature.
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self {
            verifiers: vec![
                Arc::new(AncestryVerifier),
                Arc::new(LamportClockVerifier),
                Arc::new(SignatureVerifier::new(resolver)),
            ],
        }
    }

    /// Appends a verifier after the ones already present.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    pub fn verify(
        &self,
        reader: &dyn TransactionReader,
        transaction: &Transaction,
    ) -> Result<(), DagError> {
        for verifier in &self.verifiers {
            if let Err(e) = verifier.verify(reader, transaction) {
                debug!(
                    verifier = verifier.name(),
                    reference = %transaction.reference(),
                    error = %e,
                    "Transaction rejected"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.verifiers.iter().map(|v| v.name()).collect()
    }
}

impl std::fmt::Debug for VerifierPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierPipeline")
            .field("verifiers", &self.names())
            .finish()
    }
}
