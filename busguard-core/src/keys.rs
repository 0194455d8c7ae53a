//! P-256 key material and Authority Key Identifier derivation.

use std::fmt;

use p256::ecdsa::VerifyingKey;
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Raw byte length of a stored public key (X ‖ Y coordinates).
pub const PUBLIC_KEY_LEN: usize = 64;

/// A NIST P-256 public key, held as the raw X ‖ Y coordinate concatenation.
///
/// The public key is the unique identifier of an application and one half of
/// the compound key of groups and identities. Canonical JSON carries it as a
/// 128-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::Crypto(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(PublicKey(raw))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Crypto(format!("bad key hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        // Uncompressed SEC1 encoding is 0x04 || X || Y.
        let point = key.to_encoded_point(false);
        let sec1 = point.as_bytes();
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        raw.copy_from_slice(&sec1[1..]);
        PublicKey(raw)
    }

    pub fn to_verifying_key(&self) -> Result<VerifyingKey> {
        let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(&self.0));
        VerifyingKey::from_encoded_point(&point)
            .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Authority Key Identifier: lowercase hex SHA-1 of the raw point, used
    /// as both issuer and subject CN throughout the certificate schema.
    pub fn aki(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.0);
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..12])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A public key together with its derived AKI, as exposed by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub public_key: PublicKey,
    pub aki: String,
}

impl KeyInfo {
    pub fn new(public_key: PublicKey) -> Self {
        let aki = public_key.aki();
        KeyInfo { public_key, aki }
    }
}
