//! Transaction model and wire format.
//!
//! A transaction is stored and exchanged as a JWS compact serialization:
//!
//! ```text
//! base64url(header) "." base64url(hex(payload_hash)) "." base64url(signature)
//! ```
//!
//! The header is a JSON object with the members `alg`, `cty`, `jwk` or `kid`,
//! `lc`, `prevs`, `sigt` and `ver`, in that order. The reference of a
//! transaction is the BLAKE3 hash of the whole document, so it is never
//! stored inside the document and can be recomputed by every peer.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use trustdag_core::Hash;
use trustdag_crypto::{Jwk, PublicKey, SignatureAlgorithm};

/// Document format version written into every header.
pub const FORMAT_VERSION: u32 = 1;

/// Structural parse failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedDocument {
    /// The document does not consist of exactly three `.` separated segments
    #[error("expected 3 segments, found {found}")]
    SegmentCount { found: usize },

    /// A segment is not valid base64url or not valid UTF-8
    #[error("{segment} segment is not correctly encoded")]
    Encoding { segment: &'static str },

    /// The structure is valid but a value is not
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors raised while building, signing or parsing transactions.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("malformed transaction: {0}")]
    Malformed(#[from] MalformedDocument),

    #[error("invalid lamport clock {clock}: {reason}")]
    InvalidClock { clock: u32, reason: String },

    #[error("duplicate previous transaction: {0}")]
    DuplicateParent(Hash),

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// How a transaction names the key that signed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKeyRef {
    /// Public key embedded in the header as a JWK
    Embedded(PublicKey),
    /// Key ID to be resolved through a `KeyResolver`
    ById(String),
}

/// A parent transaction together with its clock, as needed to compute the
/// clock of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    pub reference: Hash,
    pub lamport_clock: u32,
}

/// Clock of a transaction with the given parent clocks: `max + 1`, or `0`
/// for a root.
pub fn next_lamport_clock<I>(parent_clocks: I) -> Result<u32, TransactionError>
where
    I: IntoIterator<Item = u32>,
{
    match parent_clocks.into_iter().max() {
        None => Ok(0),
        Some(max) => max.checked_add(1).ok_or(TransactionError::InvalidClock {
            clock: max,
            reason: "lamport clock overflow".to_string(),
        }),
    }
}

/// Transaction contents before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    payload_hash: Hash,
    payload_type: String,
    prevs: Vec<Hash>,
    lamport_clock: u32,
}

impl UnsignedTransaction {
    /// Builds an unsigned transaction.
    ///
    /// The previous list is `parents` followed by `additional_prevs`; a
    /// reference may appear only once across both. Only the structure of the
    /// clock is checked here (zero exactly for roots). Whether it matches the
    /// parents is decided by the verifier pipeline against the store.
    pub fn new(
        payload_hash: Hash,
        payload_type: impl Into<String>,
        parents: &[Hash],
        additional_prevs: &[Hash],
        lamport_clock: u32,
    ) -> Result<Self, TransactionError> {
        let payload_type = payload_type.into();
        if payload_type.trim().is_empty() {
            return Err(TransactionError::InvalidField {
                field: "payload_type",
                reason: "must not be empty".to_string(),
            });
        }

        let mut prevs = Vec::with_capacity(parents.len() + additional_prevs.len());
        let mut seen = HashSet::new();
        for reference in parents.iter().chain(additional_prevs) {
            if !seen.insert(*reference) {
                return Err(TransactionError::DuplicateParent(*reference));
            }
            prevs.push(*reference);
        }

        if prevs.is_empty() && lamport_clock != 0 {
            return Err(TransactionError::InvalidClock {
                clock: lamport_clock,
                reason: "a root transaction must have clock 0".to_string(),
            });
        }
        if !prevs.is_empty() && lamport_clock == 0 {
            return Err(TransactionError::InvalidClock {
                clock: lamport_clock,
                reason: "a transaction with previous transactions cannot have clock 0"
                    .to_string(),
            });
        }

        Ok(Self {
            payload_hash,
            payload_type,
            prevs,
            lamport_clock,
        })
    }

    /// Builds an unsigned transaction on top of `parents`, deriving its clock.
    pub fn from_parents(
        payload_hash: Hash,
        payload_type: impl Into<String>,
        parents: &[ParentRef],
    ) -> Result<Self, TransactionError> {
        let clock = next_lamport_clock(parents.iter().map(|p| p.lamport_clock))?;
        let references: Vec<Hash> = parents.iter().map(|p| p.reference).collect();
        Self::new(payload_hash, payload_type, &references, &[], clock)
    }

    pub fn payload_hash(&self) -> Hash {
        self.payload_hash
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn prevs(&self) -> &[Hash] {
        &self.prevs
    }

    pub fn lamport_clock(&self) -> u32 {
        self.lamport_clock
    }

    /// Encodes the JWS signing input, i.e. the first two segments.
    pub(crate) fn signing_input(
        &self,
        algorithm: SignatureAlgorithm,
        signing_time: u64,
        key: &SigningKeyRef,
    ) -> Result<String, TransactionError> {
        let (jwk, kid) = match key {
            SigningKeyRef::Embedded(public_key) => (Some(public_key.to_jwk()), None),
            SigningKeyRef::ById(key_id) => (None, Some(key_id.clone())),
        };
        let header = Header {
            alg: algorithm.jws_name().to_string(),
            cty: self.payload_type.clone(),
            jwk,
            kid,
            lc: self.lamport_clock,
            prevs: self.prevs.iter().map(Hash::to_hex).collect(),
            sigt: signing_time,
            ver: FORMAT_VERSION,
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| TransactionError::InvalidField {
                field: "header",
                reason: e.to_string(),
            })?;

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(self.payload_hash.to_hex())
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    cty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    lc: u32,
    prevs: Vec<String>,
    sigt: u64,
    ver: u32,
}

/// A signed, immutable transaction.
///
/// Every field is derived from the document bytes, which are kept verbatim
/// so that serialization is the identity and the reference is stable.
#[derive(Debug, Clone)]
pub struct Transaction {
    data: String,
    signing_input_len: usize,
    algorithm: SignatureAlgorithm,
    payload_hash: Hash,
    payload_type: String,
    prevs: Vec<Hash>,
    lamport_clock: u32,
    signing_time: u64,
    signing_key: SigningKeyRef,
    signature: Vec<u8>,
}

impl Transaction {
    /// Parses a serialized transaction.
    ///
    /// The signature is decoded but not checked; that is the job of the
    /// verifier pipeline.
    pub fn parse(data: &[u8]) -> Result<Self, TransactionError> {
        let document = std::str::from_utf8(data)
            .map_err(|_| MalformedDocument::Encoding { segment: "document" })?;

        let segments: Vec<&str> = document.split('.').collect();
        if segments.len() != 3 {
            return Err(MalformedDocument::SegmentCount {
                found: segments.len(),
            }
            .into());
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(segments[0])
            .map_err(|_| MalformedDocument::Encoding { segment: "header" })?;
        let header_value: serde_json::Value = serde_json::from_slice(&header_bytes)
            .map_err(|e| invalid_field("header", e.to_string()))?;

        // The algorithm is settled before any other member is looked at
        let alg = header_value
            .get("alg")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid_field("alg", "missing".to_string()))?;
        let algorithm: SignatureAlgorithm = alg
            .parse()
            .map_err(|_| TransactionError::UnsupportedAlgorithm(alg.to_string()))?;
        if !algorithm.is_accepted() {
            return Err(TransactionError::UnsupportedAlgorithm(alg.to_string()));
        }

        let header: Header = serde_json::from_value(header_value)
            .map_err(|e| invalid_field("header", e.to_string()))?;

        if header.ver != FORMAT_VERSION {
            return Err(invalid_field(
                "ver",
                format!("unsupported version {}", header.ver),
            ));
        }
        if header.cty.trim().is_empty() {
            return Err(invalid_field("cty", "must not be empty".to_string()));
        }

        let mut prevs = Vec::with_capacity(header.prevs.len());
        let mut seen = HashSet::new();
        for prev in &header.prevs {
            let reference =
                Hash::parse_hex(prev).map_err(|e| invalid_field("prevs", e.to_string()))?;
            if !seen.insert(reference) {
                return Err(TransactionError::DuplicateParent(reference));
            }
            prevs.push(reference);
        }

        let signing_key = match (header.jwk, header.kid) {
            (Some(jwk), None) => SigningKeyRef::Embedded(
                PublicKey::from_jwk(&jwk).map_err(|e| invalid_field("jwk", e.to_string()))?,
            ),
            (None, Some(kid)) if !kid.trim().is_empty() => SigningKeyRef::ById(kid),
            (None, Some(_)) => {
                return Err(invalid_field("kid", "must not be empty".to_string()))
            }
            (Some(_), Some(_)) => {
                return Err(invalid_field("jwk", "both jwk and kid present".to_string()))
            }
            (None, None) => {
                return Err(invalid_field("kid", "neither jwk nor kid present".to_string()))
            }
        };

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(segments[1])
            .map_err(|_| MalformedDocument::Encoding { segment: "payload" })?;
        let payload_hex = std::str::from_utf8(&payload_bytes)
            .map_err(|_| MalformedDocument::Encoding { segment: "payload" })?;
        let payload_hash =
            Hash::parse_hex(payload_hex).map_err(|e| invalid_field("payload", e.to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(segments[2])
            .map_err(|_| MalformedDocument::Encoding {
                segment: "signature",
            })?;
        if signature.is_empty() {
            return Err(invalid_field("signature", "empty".to_string()));
        }

        Ok(Self {
            data: document.to_string(),
            signing_input_len: segments[0].len() + 1 + segments[1].len(),
            algorithm,
            payload_hash,
            payload_type: header.cty,
            prevs,
            lamport_clock: header.lc,
            signing_time: header.sigt,
            signing_key,
            signature,
        })
    }

    /// Content address of this transaction.
    pub fn reference(&self) -> Hash {
        Hash::sum(self.data.as_bytes())
    }

    /// The serialized document.
    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Bytes covered by the signature.
    pub fn signing_input(&self) -> &[u8] {
        &self.data.as_bytes()[..self.signing_input_len]
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn payload_hash(&self) -> Hash {
        self.payload_hash
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn prevs(&self) -> &[Hash] {
        &self.prevs
    }

    pub fn is_root(&self) -> bool {
        self.prevs.is_empty()
    }

    pub fn lamport_clock(&self) -> u32 {
        self.lamport_clock
    }

    /// Unix milliseconds claimed by the signer.
    pub fn signing_time(&self) -> u64 {
        self.signing_time
    }

    pub fn signing_key(&self) -> &SigningKeyRef {
        &self.signing_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Transaction {}

fn invalid_field(field: &'static str, reason: String) -> TransactionError {
    MalformedDocument::InvalidField { field, reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::TransactionSigner;
    use trustdag_crypto::{Ed25519KeyPair, KeySigner};

    fn key() -> Ed25519KeyPair {
        Ed25519KeyPair::from_key(&[42u8; 32]).unwrap()
    }

    fn encode(value: &serde_json::Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    fn document(header: serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            encode(&header),
            URL_SAFE_NO_PAD.encode(Hash::sum(b"payload").to_hex()),
            URL_SAFE_NO_PAD.encode([1u8; 64])
        )
    }

    fn root() -> Transaction {
        let unsigned =
            UnsignedTransaction::new(Hash::sum(b"payload"), "application/vc+jwt", &[], &[], 0)
                .unwrap();
        TransactionSigner::new(false)
            .sign(&unsigned, 1_700_000_000_000, &key())
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let tx = root();
        let parsed = Transaction::parse(tx.data()).unwrap();

        assert_eq!(parsed, tx);
        assert_eq!(parsed.reference(), tx.reference());
        assert_eq!(parsed.payload_hash(), Hash::sum(b"payload"));
        assert_eq!(parsed.payload_type(), "application/vc+jwt");
        assert_eq!(parsed.signing_time(), 1_700_000_000_000);
        assert_eq!(
            parsed.signing_key(),
            &SigningKeyRef::ById(key().key_id().to_string())
        );
        assert!(parsed.is_root());
    }

    #[test]
    fn test_reference_is_hash_of_data() {
        let tx = root();
        assert_eq!(tx.reference(), Hash::sum(tx.data()));
    }

    #[test]
    fn test_header_member_order() {
        let tx = root();
        let header_segment = tx.as_str().split('.').next().unwrap();
        let header = String::from_utf8(URL_SAFE_NO_PAD.decode(header_segment).unwrap()).unwrap();
        let members = [
            "\"alg\"", "\"cty\"", "\"kid\"", "\"lc\"", "\"prevs\"", "\"sigt\"", "\"ver\"",
        ];
        let positions: Vec<usize> = members
            .iter()
            .map(|member| header.find(member).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_signing_input_is_first_two_segments() {
        let tx = root();
        let expected = tx.as_str().rsplit_once('.').unwrap().0;
        assert_eq!(tx.signing_input(), expected.as_bytes());
    }

    #[test]
    fn test_next_lamport_clock() {
        assert_eq!(next_lamport_clock(Vec::new()).unwrap(), 0);
        assert_eq!(next_lamport_clock(vec![0, 3, 1]).unwrap(), 4);
        assert!(matches!(
            next_lamport_clock(vec![u32::MAX]),
            Err(TransactionError::InvalidClock { .. })
        ));
    }

    #[test]
    fn test_new_rejects_duplicates_across_lists() {
        let a = Hash::sum(b"a");
        let b = Hash::sum(b"b");
        let result = UnsignedTransaction::new(Hash::sum(b"p"), "t", &[a, b], &[a], 1);
        assert!(matches!(result, Err(TransactionError::DuplicateParent(h)) if h == a));

        let ok = UnsignedTransaction::new(Hash::sum(b"p"), "t", &[a], &[b], 1).unwrap();
        assert_eq!(ok.prevs(), &[a, b]);
    }

    #[test]
    fn test_new_checks_clock_structure() {
        let a = Hash::sum(b"a");
        assert!(matches!(
            UnsignedTransaction::new(Hash::sum(b"p"), "t", &[], &[], 3),
            Err(TransactionError::InvalidClock { clock: 3, .. })
        ));
        assert!(matches!(
            UnsignedTransaction::new(Hash::sum(b"p"), "t", &[a], &[], 0),
            Err(TransactionError::InvalidClock { clock: 0, .. })
        ));
    }

    #[test]
    fn test_new_rejects_empty_payload_type() {
        let result = UnsignedTransaction::new(Hash::sum(b"p"), " ", &[], &[], 0);
        assert!(matches!(
            result,
            Err(TransactionError::InvalidField { field: "payload_type", .. })
        ));
    }

    #[test]
    fn test_from_parents_derives_clock() {
        let parents = [
            ParentRef {
                reference: Hash::sum(b"a"),
                lamport_clock: 1,
            },
            ParentRef {
                reference: Hash::sum(b"b"),
                lamport_clock: 4,
            },
        ];
        let unsigned = UnsignedTransaction::from_parents(Hash::sum(b"p"), "t", &parents).unwrap();
        assert_eq!(unsigned.lamport_clock(), 5);
        assert_eq!(unsigned.prevs().len(), 2);
    }

    #[test]
    fn test_parse_segment_count() {
        assert!(matches!(
            Transaction::parse(b"abc.def"),
            Err(TransactionError::Malformed(MalformedDocument::SegmentCount { found: 2 }))
        ));
        assert!(matches!(
            Transaction::parse(b"a.b.c.d"),
            Err(TransactionError::Malformed(MalformedDocument::SegmentCount { found: 4 }))
        ));
    }

    #[test]
    fn test_parse_encoding_errors() {
        assert!(matches!(
            Transaction::parse(b"!!!.abc.abc"),
            Err(TransactionError::Malformed(MalformedDocument::Encoding { segment: "header" }))
        ));
        assert!(matches!(
            Transaction::parse(&[0xff, b'.', b'a', b'.', b'b']),
            Err(TransactionError::Malformed(MalformedDocument::Encoding { segment: "document" }))
        ));
    }

    #[test]
    fn test_parse_rejects_unsupported_algorithm_first() {
        // Key and version members are invalid too; the algorithm wins
        let doc = document(serde_json::json!({
            "alg": "ES256",
            "cty": "t",
            "lc": 0,
            "prevs": [],
            "sigt": 0,
            "ver": 99,
        }));
        assert!(matches!(
            Transaction::parse(doc.as_bytes()),
            Err(TransactionError::UnsupportedAlgorithm(alg)) if alg == "ES256"
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let doc = document(serde_json::json!({
            "alg": "EdDSA",
            "cty": "t",
            "kid": "k",
            "lc": 0,
            "prevs": [],
            "sigt": 0,
            "ver": 2,
        }));
        assert!(matches!(
            Transaction::parse(doc.as_bytes()),
            Err(TransactionError::Malformed(MalformedDocument::InvalidField { field: "ver", .. }))
        ));
    }

    #[test]
    fn test_parse_requires_exactly_one_key_reference() {
        let doc = document(serde_json::json!({
            "alg": "EdDSA",
            "cty": "t",
            "lc": 0,
            "prevs": [],
            "sigt": 0,
            "ver": 1,
        }));
        assert!(matches!(
            Transaction::parse(doc.as_bytes()),
            Err(TransactionError::Malformed(MalformedDocument::InvalidField { field: "kid", .. }))
        ));
    }

    #[test]
    fn test_parse_rejects_duplicate_prevs() {
        let prev = Hash::sum(b"a").to_hex();
        let doc = document(serde_json::json!({
            "alg": "EdDSA",
            "cty": "t",
            "kid": "k",
            "lc": 1,
            "prevs": [prev, prev],
            "sigt": 0,
            "ver": 1,
        }));
        assert!(matches!(
            Transaction::parse(doc.as_bytes()),
            Err(TransactionError::DuplicateParent(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_prev_hash() {
        let doc = document(serde_json::json!({
            "alg": "EdDSA",
            "cty": "t",
            "kid": "k",
            "lc": 1,
            "prevs": ["not-a-hash"],
            "sigt": 0,
            "ver": 1,
        }));
        assert!(matches!(
            Transaction::parse(doc.as_bytes()),
            Err(TransactionError::Malformed(MalformedDocument::InvalidField { field: "prevs", .. }))
        ));
    }

    #[test]
    fn test_embedded_key_round_trip() {
        let unsigned = UnsignedTransaction::new(Hash::sum(b"payload"), "t", &[], &[], 0).unwrap();
        let tx = TransactionSigner::new(true).sign(&unsigned, 5, &key()).unwrap();
        assert_eq!(
            tx.signing_key(),
            &SigningKeyRef::Embedded(key().public_key())
        );
        assert_eq!(Transaction::parse(tx.data()).unwrap(), tx);
    }
}
