//! Compact SHA-256 hash type for content addressing
//!
//! This module provides the content-address key used throughout the storage
//! layer. Hashes are stored as raw 32-byte arrays instead of hex strings,
//! which keeps manifest maps cheap to compare and avoids heap allocation for
//! every lookup. Hex formatting is applied only at the edges (file names,
//! JSON, logs).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{VerifyError, VerifyResult};

/// SHA-256 content hash stored as a 32-byte array
///
/// The type maintains full compatibility with hex string formats through
/// transparent serialization and display formatting, so manifests and blob
/// file names always carry the familiar 64-character lowercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Hash([u8; 32]);

impl Sha256Hash {
    /// Create a hash from a hex string
    ///
    /// # Arguments
    ///
    /// * `hex` - 64-character hexadecimal string (case insensitive)
    ///
    /// # Returns
    ///
    /// `Ok(Sha256Hash)` if the string is a valid SHA-256 hex representation,
    /// `Err(VerifyError::InvalidHeader)` otherwise
    pub fn from_hex(hex: &str) -> VerifyResult<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VerifyError::InvalidHeader {
                reason: format!("invalid SHA-256 hex string: {hex:?}"),
            });
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hex_pair = std::str::from_utf8(chunk).unwrap(); // Safe: validated above
            bytes[i] = u8::from_str_radix(hex_pair, 16).unwrap(); // Safe: validated above
        }

        Ok(Sha256Hash(bytes))
    }

    /// Convert the hash to a lowercase 64-character hex string
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        self.0.iter().fold(String::with_capacity(64), |mut acc, b| {
            write!(&mut acc, "{:02x}", b).unwrap();
            acc
        })
    }

    /// Get the raw byte array representation
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Sha256Hash(bytes)
    }

    /// Compute the hash of an in-memory buffer
    ///
    /// Streaming hashing over files lives in [`crate::app::verify`]; this is
    /// for small buffers (tests, manifest sanity checks).
    pub fn digest(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Sha256Hash(bytes)
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Sha256Hash {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Transparent serialization - serialize as hex string for JSON compatibility
impl Serialize for Sha256Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_string = String::deserialize(deserializer)?;
        Self::from_hex(&hex_string).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher for streaming verification
///
/// Thin wrapper over [`sha2::Sha256`] that finalizes into [`Sha256Hash`],
/// keeping the digest implementation out of caller code.
#[derive(Debug, Default)]
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    /// Create a fresh hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a buffer into the hash state
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the content hash
    pub fn finalize(self) -> Sha256Hash {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Sha256Hash(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_valid_hex_round_trip() {
        let hash = Sha256Hash::from_hex(SAMPLE).unwrap();
        assert_eq!(hash.to_hex(), SAMPLE);
    }

    #[test]
    fn test_case_insensitive() {
        let lower = Sha256Hash::from_hex(SAMPLE).unwrap();
        let upper = Sha256Hash::from_hex(&SAMPLE.to_uppercase()).unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.to_hex(), SAMPLE); // Always returns lowercase
    }

    #[test]
    fn test_invalid_hex_strings() {
        let invalid_cases = [
            "",
            "2cf24dba5fb0a30e",                                                  // Too short
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b98244", // Too long
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b982g",  // Bad char
        ];

        for hex in &invalid_cases {
            assert!(Sha256Hash::from_hex(hex).is_err(), "Should reject: {}", hex);
        }
    }

    #[test]
    fn test_digest_known_vector() {
        // sha256("hello") is a well-known vector
        let hash = Sha256Hash::digest(b"hello");
        assert_eq!(hash.to_hex(), SAMPLE);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"he");
        hasher.update(b"llo");
        assert_eq!(hasher.finalize(), Sha256Hash::digest(b"hello"));
    }

    #[test]
    fn test_from_str_and_display() {
        let hash: Sha256Hash = SAMPLE.parse().unwrap();
        assert_eq!(format!("{}", hash), SAMPLE);
    }

    #[test]
    fn test_serialization() {
        let hash = Sha256Hash::from_hex(SAMPLE).unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", SAMPLE));

        let deserialized: Sha256Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, deserialized);
    }

    #[test]
    fn test_memory_layout() {
        assert_eq!(std::mem::size_of::<Sha256Hash>(), 32);
    }
}
