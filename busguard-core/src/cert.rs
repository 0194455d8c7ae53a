//! Identity and membership certificates.
//!
//! Certificates are value types signed over their canonical encoding. The
//! encoded form carries every field remote peers interpret: serial, validity,
//! subject and issuer CNs (both AKIs), the manifest digest and alias for
//! identity certificates, and the guild for membership certificates.
//! DER-level X.509 framing belongs to the crypto/transport layer and is not
//! reproduced here.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::keys::PublicKey;

/// Back-dating applied to `not_before` to tolerate clock skew between the
/// agent and the remote application.
const NOT_BEFORE_SKEW_SECS: i64 = 3600;
/// Issued certificates are valid for ten years.
const VALIDITY_PERIOD_SECS: i64 = 10 * 365 * 24 * 3600;

/// Certificate validity window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    /// The standard issuance window: one hour in the past to ten years out.
    pub fn standard() -> Validity {
        let now = Utc::now().timestamp();
        Validity {
            not_before: now - NOT_BEFORE_SKEW_SECS,
            not_after: now + VALIDITY_PERIOD_SECS,
        }
    }

    pub fn contains(&self, at: i64) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// An identity certificate: binds an application's public key to an identity
/// name and a manifest digest under this CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCertificate {
    /// Decimal serial number; empty until signed.
    pub serial: String,
    pub validity: Validity,
    pub subject_public_key: PublicKey,
    /// AKI of the issuing CA key.
    pub issuer_cn: String,
    /// AKI of the subject key.
    pub subject_cn: String,
    /// Name of the identity this certificate asserts.
    pub subject_ou: String,
    /// Identity GUID as 32-character hex.
    pub alias: String,
    /// SHA-256 of the subject's manifest in canonical form.
    #[serde(with = "hex_digest")]
    pub manifest_digest: [u8; 32],
    /// DER ECDSA signature over the canonical encoding with this field empty.
    #[serde(with = "b64_signature")]
    pub signature: Vec<u8>,
}

/// A membership certificate: asserts that an application belongs to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipCertificate {
    /// Decimal serial number; empty until signed.
    pub serial: String,
    pub validity: Validity,
    pub subject_public_key: PublicKey,
    pub issuer_cn: String,
    pub subject_cn: String,
    /// GUID of the group this certificate asserts membership of.
    pub guild: Guid,
    /// CA flag; always false on issued leaf certificates.
    pub ca: bool,
    #[serde(with = "b64_signature")]
    pub signature: Vec<u8>,
}

/// A membership certificate chain. Chains issued by this agent have a single
/// element; the type exists because the wire operations carry chains.
pub type MembershipChain = Vec<MembershipCertificate>;

macro_rules! cert_encoding {
    ($ty:ty) => {
        impl $ty {
            /// The canonical to-be-signed encoding (signature field empty).
            pub fn tbs_bytes(&self) -> Result<Vec<u8>> {
                let mut unsigned = self.clone();
                unsigned.signature = Vec::new();
                canonical::encode(&unsigned)
            }

            /// Full signed encoding, as persisted and sent on the wire.
            pub fn encode(&self) -> Result<Vec<u8>> {
                canonical::encode(self)
            }

            pub fn decode(bytes: &[u8]) -> Result<Self> {
                canonical::decode(bytes)
            }

            /// Serial parsed as an unsigned decimal integer, the form the
            /// reconciler compares to detect a pending identity update.
            pub fn serial_number(&self) -> Result<u32> {
                self.serial
                    .parse()
                    .map_err(|_| Error::Serialization(format!("bad serial {:?}", self.serial)))
            }
        }
    };
}

cert_encoding!(IdentityCertificate);
cert_encoding!(MembershipCertificate);

/// A certificate of either kind, for APIs that dispatch on the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Certificate {
    Identity(IdentityCertificate),
    Membership(MembershipCertificate),
}

impl From<IdentityCertificate> for Certificate {
    fn from(cert: IdentityCertificate) -> Self {
        Certificate::Identity(cert)
    }
}

impl From<MembershipCertificate> for Certificate {
    fn from(cert: MembershipCertificate) -> Self {
        Certificate::Membership(cert)
    }
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        digest: &[u8; 32],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))
    }
}

mod b64_signature {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

    pub fn serialize<S: Serializer>(sig: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ENGINE.encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        ENGINE.decode(&s).map_err(serde::de::Error::custom)
    }
}
