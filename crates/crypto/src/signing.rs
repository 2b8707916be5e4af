//! Transaction signing capability.
//!
//! [`KeySigner`] is the boundary to whatever holds private keys (an HSM, a
//! key store service, an in-process key). The DAG signer only needs the key
//! ID, the algorithm, the public key and a `sign` operation.
//!
//! # Security Model
//!
//! - Private keys never leave the signer
//! - Key bytes copied into the signer are zeroized after use
//! - Ed25519 signatures are deterministic for the same input

use crate::keys::PublicKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroize;

/// JWS signature algorithms known to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// EdDSA over Ed25519, the only accepted algorithm
    EdDSA,
    ES256,
    ES384,
    ES256K,
    RS256,
    PS256,
}

impl SignatureAlgorithm {
    /// The algorithm every transaction on the DAG must use.
    pub const ACCEPTED: SignatureAlgorithm = SignatureAlgorithm::EdDSA;

    /// JWS `alg` header value.
    pub fn jws_name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::EdDSA => "EdDSA",
            SignatureAlgorithm::ES256 => "ES256",
            SignatureAlgorithm::ES384 => "ES384",
            SignatureAlgorithm::ES256K => "ES256K",
            SignatureAlgorithm::RS256 => "RS256",
            SignatureAlgorithm::PS256 => "PS256",
        }
    }

    pub fn is_accepted(&self) -> bool {
        *self == Self::ACCEPTED
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jws_name())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EdDSA" => Ok(SignatureAlgorithm::EdDSA),
            "ES256" => Ok(SignatureAlgorithm::ES256),
            "ES384" => Ok(SignatureAlgorithm::ES384),
            "ES256K" => Ok(SignatureAlgorithm::ES256K),
            "RS256" => Ok(SignatureAlgorithm::RS256),
            "PS256" => Ok(SignatureAlgorithm::PS256),
            other => Err(SigningError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Errors that can occur during signing and signature checks.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid key material: {reason}")]
    InvalidKey { reason: String },

    #[error("Invalid signature: {reason}")]
    InvalidSignature { reason: String },

    #[error("Cryptographic error: {reason}")]
    CryptoError { reason: String },
}

/// A signing capability backed by a private key the caller never sees.
pub trait KeySigner: Send + Sync {
    /// Identifier under which verifiers can resolve the public key.
    fn key_id(&self) -> &str;

    fn algorithm(&self) -> SignatureAlgorithm;

    fn public_key(&self) -> PublicKey;

    /// Signs `message` and returns the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// In-process Ed25519 key.
///
/// For production use, keys should be held by an external signing backend
/// implementing [`KeySigner`].
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
    key_id: String,
}

impl Ed25519KeyPair {
    /// Generates a fresh key with a key ID derived from its public key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut secret_key_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_key_bytes);

        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();

        let key_id = Self::generate_key_id(&signing_key.verifying_key());
        Self {
            signing_key,
            key_id,
        }
    }

    /// Creates a key pair from an existing 32 byte secret.
    ///
    /// # Security
    /// The intermediate copy of the secret is zeroized.
    pub fn from_key(key_bytes: &[u8]) -> Result<Self, SigningError> {
        if key_bytes.len() != 32 {
            return Err(SigningError::InvalidKey {
                reason: format!("Invalid key length: {} (expected 32)", key_bytes.len()),
            });
        }

        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(key_bytes);
        let signing_key = SigningKey::from_bytes(&key_array);
        key_array.zeroize();

        let key_id = Self::generate_key_id(&signing_key.verifying_key());
        Ok(Self {
            signing_key,
            key_id,
        })
    }

    /// Replaces the derived key ID, e.g. with a DID URL such as
    /// `did:example:123#key-1`.
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    /// Stable identifier derived from the public key: the first 16 bytes of
    /// its BLAKE3 hash, hex encoded.
    fn generate_key_id(verifying_key: &VerifyingKey) -> String {
        let hash = blake3::hash(verifying_key.as_bytes());
        hex::encode(&hash.as_bytes()[..16])
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl KeySigner for Ed25519KeyPair {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EdDSA
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::ed25519(&self.signing_key.verifying_key())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
