//! Content addressing.
//!
//! Every transaction and payload in the DAG is identified by the BLAKE3 hash
//! of its bytes. The same bytes always produce the same [`Hash`], on every
//! platform, so a hash can be recomputed by any peer to check what it
//! received.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of a hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A 256-bit BLAKE3 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash, used where no hash is available.
    pub const EMPTY: Hash = Hash([0u8; HASH_SIZE]);

    /// Hashes the given bytes.
    pub fn sum(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// Wraps raw hash bytes.
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Copies a hash out of a slice, which must be exactly [`HASH_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            CoreError::InvalidHash(format!(
                "expected {} bytes, got {}",
                HASH_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Hash(array))
    }

    /// Parses a hex encoded hash.
    pub fn parse_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input.trim())
            .map_err(|e| CoreError::InvalidHash(format!("{}: {}", input, e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_hex(s)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_is_deterministic() {
        let a = Hash::sum(b"credential");
        let b = Hash::sum(b"credential");
        assert_eq!(a, b);
        assert_ne!(a, Hash::sum(b"revocation"));
    }

    #[test]
    fn test_sum_matches_blake3() {
        let expected = blake3::hash(b"abc");
        assert_eq!(Hash::sum(b"abc").as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = Hash::sum(b"payload");
        let parsed = Hash::parse_hex(&hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn test_parse_hex_rejects_wrong_length() {
        let result = Hash::parse_hex("abcd");
        assert!(matches!(result, Err(CoreError::InvalidHash(_))));
    }

    #[test]
    fn test_parse_hex_rejects_non_hex() {
        let input = "zz".repeat(32);
        assert!(Hash::parse_hex(&input).is_err());
    }

    #[test]
    fn test_empty_hash() {
        assert!(Hash::EMPTY.is_empty());
        assert!(!Hash::sum(b"").is_empty());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = Hash::sum(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
