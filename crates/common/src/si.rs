// Storage-index identity: 16 opaque bytes, rendered as 26 lowercase
// base-32 characters for storage keys. The first two characters are the
// crawler prefix, partitioning the keyspace into 1024 buckets.

use data_encoding::Encoding;
use data_encoding_macro::new_encoding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowercase RFC 3548 alphabet, no padding.
const SI_BASE32: Encoding = new_encoding! {
    symbols: "abcdefghijklmnopqrstuvwxyz234567",
};

/// Byte length of a storage index.
pub const SI_BYTES: usize = 16;
/// Rendered length: ceil(128 / 5) symbols.
pub const SI_STRING_LEN: usize = 26;
/// Length of a crawler prefix.
pub const PREFIX_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageIndexError {
    #[error("storage index must be {SI_BYTES} bytes, got {0}")]
    BadLength(usize),

    #[error("storage index string must be {SI_STRING_LEN} base-32 characters: {0:?}")]
    BadString(String),
}

/// 16-byte opaque content identifier for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageIndex([u8; SI_BYTES]);

impl StorageIndex {
    pub fn new(bytes: [u8; SI_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StorageIndexError> {
        let array: [u8; SI_BYTES] =
            bytes.try_into().map_err(|_| StorageIndexError::BadLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SI_BYTES] {
        &self.0
    }

    /// Render as the 26-character base-32 storage key.
    pub fn to_base32(&self) -> String {
        SI_BASE32.encode(&self.0)
    }

    /// Parse the 26-character base-32 rendering back into raw bytes.
    ///
    /// Only the canonical form is accepted: lowercase alphabet, exact
    /// length, zero trailing bits.
    pub fn parse(s: &str) -> Result<Self, StorageIndexError> {
        if s.len() != SI_STRING_LEN {
            return Err(StorageIndexError::BadString(s.to_string()));
        }
        let bytes = SI_BASE32
            .decode(s.as_bytes())
            .map_err(|_| StorageIndexError::BadString(s.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// First two characters of the base-32 rendering.
    pub fn prefix(&self) -> String {
        let mut s = self.to_base32();
        s.truncate(PREFIX_LEN);
        s
    }
}

impl std::fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl Serialize for StorageIndex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for StorageIndex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// All 1024 two-character prefixes in lexicographic order.
///
/// This is the fixed partition the crawler walks, one prefix per slice.
pub fn all_prefixes() -> Vec<String> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut prefixes = Vec::with_capacity(ALPHABET.len() * ALPHABET.len());
    for &a in ALPHABET {
        for &b in ALPHABET {
            prefixes.push(format!("{}{}", a as char, b as char));
        }
    }
    prefixes.sort();
    prefixes
}
