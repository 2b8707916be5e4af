//! Public key material and key resolution.

use crate::signing::{SignatureAlgorithm, SigningError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// JSON Web Key as embedded in transaction headers.
///
/// Only the members needed for OKP and EC public keys are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// Public key type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Algorithm the key is meant for
    pub algorithm: SignatureAlgorithm,
    /// Raw key bytes: the 32 byte point for Ed25519, `x || y` for EC curves
    pub data: Vec<u8>,
}

impl PublicKey {
    pub fn ed25519(key: &VerifyingKey) -> Self {
        Self {
            algorithm: SignatureAlgorithm::EdDSA,
            data: key.as_bytes().to_vec(),
        }
    }

    /// Converts to an Ed25519 verifying key.
    ///
    /// Fails for any other key type, and for bytes that are not a valid
    /// curve point.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, SigningError> {
        if self.algorithm != SignatureAlgorithm::EdDSA {
            return Err(SigningError::UnsupportedAlgorithm(
                self.algorithm.to_string(),
            ));
        }
        let bytes: [u8; 32] =
            self.data
                .as_slice()
                .try_into()
                .map_err(|_| SigningError::InvalidKey {
                    reason: format!("Ed25519 key must be 32 bytes, got {}", self.data.len()),
                })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::InvalidKey {
            reason: e.to_string(),
        })
    }

    /// Checks an Ed25519 signature over `message`.
    ///
    /// Uses strict verification, which rejects weak keys and malleable
    /// signatures.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SigningError> {
        let verifying_key = self.to_verifying_key()?;
        let signature_bytes: [u8; 64] =
            signature
                .try_into()
                .map_err(|_| SigningError::InvalidSignature {
                    reason: format!("expected 64 bytes, got {}", signature.len()),
                })?;
        let signature = Signature::from_bytes(&signature_bytes);

        verifying_key
            .verify_strict(message, &signature)
            .map_err(|e| SigningError::InvalidSignature {
                reason: e.to_string(),
            })
    }

    pub fn to_jwk(&self) -> Jwk {
        match self.algorithm {
            SignatureAlgorithm::EdDSA => Jwk {
                kty: "OKP".to_string(),
                crv: Some("Ed25519".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(&self.data)),
                y: None,
            },
            alg => {
                let half = self.data.len() / 2;
                Jwk {
                    kty: "EC".to_string(),
                    crv: Some(ec_curve_name(alg).to_string()),
                    x: Some(URL_SAFE_NO_PAD.encode(&self.data[..half])),
                    y: Some(URL_SAFE_NO_PAD.encode(&self.data[half..])),
                }
            }
        }
    }

    /// Reads an OKP (Ed25519) or EC (P-256, P-384, secp256k1) public key.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, SigningError> {
        let crv = jwk.crv.as_deref().ok_or_else(|| SigningError::InvalidKey {
            reason: "JWK has no crv member".to_string(),
        })?;
        let x = decode_coordinate(jwk.x.as_deref(), "x")?;

        match (jwk.kty.as_str(), crv) {
            ("OKP", "Ed25519") => {
                if x.len() != 32 {
                    return Err(SigningError::InvalidKey {
                        reason: format!("Ed25519 x must be 32 bytes, got {}", x.len()),
                    });
                }
                Ok(Self {
                    algorithm: SignatureAlgorithm::EdDSA,
                    data: x,
                })
            }
            ("EC", crv) => {
                let (algorithm, size) = match crv {
                    "P-256" => (SignatureAlgorithm::ES256, 32),
                    "P-384" => (SignatureAlgorithm::ES384, 48),
                    "secp256k1" => (SignatureAlgorithm::ES256K, 32),
                    other => {
                        return Err(SigningError::InvalidKey {
                            reason: format!("unsupported EC curve: {}", other),
                        })
                    }
                };
                let y = decode_coordinate(jwk.y.as_deref(), "y")?;
                if x.len() != size || y.len() != size {
                    return Err(SigningError::InvalidKey {
                        reason: format!("{} coordinates must be {} bytes", crv, size),
                    });
                }
                let mut data = x;
                data.extend_from_slice(&y);
                Ok(Self { algorithm, data })
            }
            (kty, crv) => Err(SigningError::InvalidKey {
                reason: format!("unsupported key type {} / {}", kty, crv),
            }),
        }
    }
}

fn ec_curve_name(algorithm: SignatureAlgorithm) -> &'static str {
    match algorithm {
        SignatureAlgorithm::ES384 => "P-384",
        SignatureAlgorithm::ES256K => "secp256k1",
        _ => "P-256",
    }
}

fn decode_coordinate(value: Option<&str>, member: &str) -> Result<Vec<u8>, SigningError> {
    let value = value.ok_or_else(|| SigningError::InvalidKey {
        reason: format!("JWK has no {} member", member),
    })?;
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| SigningError::InvalidKey {
            reason: format!("JWK {} is not base64url: {}", member, e),
        })
}

/// Errors returned by a [`KeyResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyResolutionError {
    /// No key is known under this ID
    #[error("Key not found: {key_id}")]
    NotFound { key_id: String },

    /// The key exists but was not valid at the requested time
    #[error("Key {key_id} not valid at {at}")]
    NotValidAt { key_id: String, at: u64 },

    /// Resolution did not finish in time
    #[error("Resolution of key {key_id} timed out after {timeout_ms}ms")]
    Timeout { key_id: String, timeout_ms: u64 },

    /// Backend failure (DID resolver, key store, ...)
    #[error("Key resolver backend error: {0}")]
    Backend(String),
}

/// Resolves the public key behind a key ID as of a point in time.
///
/// `at_millis` is the signing time claimed by the transaction, so a key that
/// was rotated out later still verifies older transactions.
pub trait KeyResolver: Send + Sync {
    fn resolve_public_key(
        &self,
        key_id: &str,
        at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError>;
}

impl<R: KeyResolver + ?Sized> KeyResolver for Arc<R> {
    fn resolve_public_key(
        &self,
        key_id: &str,
        at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError> {
        (**self).resolve_public_key(key_id, at_millis)
    }
}

/// Fixed key set, ignores time.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, PublicKey>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: impl Into<String>, key: PublicKey) -> Self {
        self.insert(key_id, key);
        self
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: PublicKey) {
        self.keys.insert(key_id.into(), key);
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve_public_key(
        &self,
        key_id: &str,
        _at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| KeyResolutionError::NotFound {
                key_id: key_id.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
struct KeyRecord {
    key: PublicKey,
    valid_from: u64,
    /// Exclusive end of validity, set on rotation or revocation
    valid_until: Option<u64>,
}

impl KeyRecord {
    fn is_valid_at(&self, at: u64) -> bool {
        self.valid_from <= at && self.valid_until.map_or(true, |until| at < until)
    }
}

/// Time-aware key registry.
///
/// Keeps every version of a key ID with its validity window, so that
/// resolution at a historic signing time returns the key that was in force
/// then.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    records: RwLock<HashMap<String, Vec<KeyRecord>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` under `key_id` from `valid_from` onwards.
    ///
    /// A still-open earlier version of the same key ID is closed at
    /// `valid_from` (rotation).
    pub fn register(
        &self,
        key_id: impl Into<String>,
        key: PublicKey,
        valid_from: u64,
    ) -> Result<(), KeyResolutionError> {
        let key_id = key_id.into();
        let mut records = self
            .records
            .write()
            .map_err(|_| KeyResolutionError::Backend("key registry lock poisoned".to_string()))?;

        let versions = records.entry(key_id.clone()).or_default();
        for record in versions.iter_mut() {
            if record.valid_until.is_none() && record.valid_from <= valid_from {
                record.valid_until = Some(valid_from);
            }
        }
        versions.push(KeyRecord {
            key,
            valid_from,
            valid_until: None,
        });

        debug!(key_id = %key_id, valid_from, "Registered key");
        Ok(())
    }

    /// Ends validity of the current version of `key_id` at `at`.
    ///
    /// Returns `false` when there was no open version to revoke.
    pub fn revoke(&self, key_id: &str, at: u64) -> Result<bool, KeyResolutionError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| KeyResolutionError::Backend("key registry lock poisoned".to_string()))?;

        let Some(versions) = records.get_mut(key_id) else {
            return Ok(false);
        };
        let mut revoked = false;
        for record in versions.iter_mut().filter(|r| r.valid_until.is_none()) {
            record.valid_until = Some(at.max(record.valid_from));
            revoked = true;
        }

        if revoked {
            debug!(key_id = %key_id, at, "Revoked key");
        }
        Ok(revoked)
    }
}

impl KeyResolver for KeyRegistry {
    fn resolve_public_key(
        &self,
        key_id: &str,
        at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError> {
        let records = self
            .records
            .read()
            .map_err(|_| KeyResolutionError::Backend("key registry lock poisoned".to_string()))?;

        let versions = records
            .get(key_id)
            .ok_or_else(|| KeyResolutionError::NotFound {
                key_id: key_id.to_string(),
            })?;

        versions
            .iter()
            .rev()
            .find(|record| record.is_valid_at(at_millis))
            .map(|record| record.key.clone())
            .ok_or_else(|| KeyResolutionError::NotValidAt {
                key_id: key_id.to_string(),
                at: at_millis,
            })
    }
}

/// Default number of resolver threads.
pub const DEFAULT_RESOLVER_WORKERS: usize = 4;

type Resolution = Result<PublicKey, KeyResolutionError>;

struct ResolveJob {
    key_id: String,
    at_millis: u64,
    deadline: Instant,
    reply: mpsc::SyncSender<Resolution>,
}

/// Bounds the time a wrapped resolver may take.
///
/// Lookups run on a fixed pool of resolver threads fed through a bounded
/// queue. A caller waits at most `timeout` for its answer and then gets
/// [`KeyResolutionError::Timeout`]; a late answer is dropped. When every
/// worker is busy and the queue is full the lookup fails at once with
/// [`KeyResolutionError::Backend`], so a hung backend pins at most the pool.
pub struct TimeoutKeyResolver {
    jobs: mpsc::SyncSender<ResolveJob>,
    timeout: Duration,
}

impl TimeoutKeyResolver {
    pub fn new<R: KeyResolver + 'static>(inner: R, timeout: Duration) -> Self {
        Self::with_workers(inner, timeout, DEFAULT_RESOLVER_WORKERS)
    }

    pub fn with_workers<R: KeyResolver + 'static>(
        inner: R,
        timeout: Duration,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        let (jobs, queue) = mpsc::sync_channel::<ResolveJob>(workers);
        let queue = Arc::new(Mutex::new(queue));
        let inner = Arc::new(inner);

        for index in 0..workers {
            let queue = Arc::clone(&queue);
            let inner = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(format!("key-resolver-{}", index))
                .spawn(move || run_resolver(queue, inner));
            if let Err(e) = spawned {
                warn!(error = %e, index, "Failed to spawn key resolver thread");
            }
        }

        Self { jobs, timeout }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

fn run_resolver<R: KeyResolver>(queue: Arc<Mutex<mpsc::Receiver<ResolveJob>>>, inner: Arc<R>) {
    loop {
        let job = {
            let Ok(queue) = queue.lock() else { return };
            match queue.recv() {
                Ok(job) => job,
                // Resolver dropped
                Err(_) => return,
            }
        };
        if Instant::now() >= job.deadline {
            continue;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.resolve_public_key(&job.key_id, job.at_millis)
        }))
        .unwrap_or_else(|_| {
            warn!(key_id = %job.key_id, "Key resolver backend panicked");
            Err(KeyResolutionError::Backend("resolver panicked".to_string()))
        });
        // Receiver is gone after a timeout
        let _ = job.reply.try_send(result);
    }
}

impl KeyResolver for TimeoutKeyResolver {
    fn resolve_public_key(
        &self,
        key_id: &str,
        at_millis: u64,
    ) -> Result<PublicKey, KeyResolutionError> {
        let (reply, answer) = mpsc::sync_channel(1);
        let job = ResolveJob {
            key_id: key_id.to_string(),
            at_millis,
            deadline: Instant::now() + self.timeout,
            reply,
        };

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                warn!(key_id = %key_id, "Key resolver saturated");
                return Err(KeyResolutionError::Backend(
                    "key resolver saturated".to_string(),
                ));
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                return Err(KeyResolutionError::Backend(
                    "no key resolver threads running".to_string(),
                ));
            }
        }

        match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let timeout_ms = self.timeout_ms();
                warn!(key_id = %key_id, timeout_ms, "Key resolution timed out");
                Err(KeyResolutionError::Timeout {
                    key_id: key_id.to_string(),
                    timeout_ms,
                })
            }
            // Skipped after its deadline passed in the queue
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(KeyResolutionError::Timeout {
                key_id: key_id.to_string(),
                timeout_ms: self.timeout_ms(),
            }),
        }
    }
}
