//! Turns unsigned transactions into signed documents.

use crate::transaction::{SigningKeyRef, Transaction, TransactionError, UnsignedTransaction};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::debug;
use trustdag_crypto::KeySigner;

/// Signs transactions with a [`KeySigner`].
///
/// The signer never touches the store. Whether the result is accepted is
/// decided when it is added.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionSigner {
    attach_key: bool,
}

impl TransactionSigner {
    /// With `attach_key` the public key is embedded as a JWK, otherwise the
    /// header carries the signer's key ID.
    pub fn new(attach_key: bool) -> Self {
        Self { attach_key }
    }

    pub fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        signing_time: u64,
        signer: &dyn KeySigner,
    ) -> Result<Transaction, TransactionError> {
        let algorithm = signer.algorithm();
        if !algorithm.is_accepted() {
            return Err(TransactionError::UnsupportedAlgorithm(
                algorithm.jws_name().to_string(),
            ));
        }

        let key = if self.attach_key {
            SigningKeyRef::Embedded(signer.public_key())
        } else {
            SigningKeyRef::ById(signer.key_id().to_string())
        };

        let signing_input = unsigned.signing_input(algorithm, signing_time, &key)?;
        let signature = signer
            .sign(signing_input.as_bytes())
            .map_err(|e| TransactionError::Signing(e.to_string()))?;

        let document = format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature));
        let transaction = Transaction::parse(document.as_bytes())?;

        debug!(
            reference = %transaction.reference(),
            payload_type = %transaction.payload_type(),
            lamport_clock = transaction.lamport_clock(),
            "Signed transaction"
        );
        Ok(transaction)
    }
}
