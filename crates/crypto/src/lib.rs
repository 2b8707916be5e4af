//! Cryptographic capabilities for TrustDAG transactions.
//!
//! The DAG core never holds private keys and never talks to DID documents
//! directly. It consumes two capabilities defined here:
//!
//! - [`KeySigner`]: produces signatures with a key held by an external
//!   signing backend. [`Ed25519KeyPair`] is the in-process implementation.
//! - [`KeyResolver`]: looks up the public key behind a key ID as of a point
//!   in time. [`StaticKeyResolver`], [`KeyRegistry`] and
//!   [`TimeoutKeyResolver`] are provided.
//!
//! # Supported Algorithms
//!
//! Exactly one signature algorithm is accepted on the DAG: EdDSA over
//! Ed25519. Other algorithms are modelled so that they can be named and
//! rejected, never verified.

pub mod keys;
pub mod signing;

pub use keys::{
    Jwk, KeyRegistry, KeyResolutionError, KeyResolver, PublicKey, StaticKeyResolver,
    TimeoutKeyResolver,
};
pub use signing::{Ed25519KeyPair, KeySigner, SignatureAlgorithm, SigningError};
