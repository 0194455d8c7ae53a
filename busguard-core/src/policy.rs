//! Versioned access-control policies.

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::error::Result;
use crate::guid::Guid;
use crate::keys::PublicKey;
use crate::rules::Rule;

/// A peer selector within an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerSpec {
    /// Any peer that completed an authenticated key exchange.
    AnyTrusted,
    /// Any peer holding an identity certificate issued by the given CA.
    FromCa { ca: PublicKey },
    /// Any peer holding a membership certificate for the given group.
    WithMembership { authority: PublicKey, group: Guid },
}

/// One access-control entry: which peers are granted which rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub peers: Vec<PeerSpec>,
    pub rules: Vec<Rule>,
}

/// The versioned rule set an administrator pushes to a claimed application.
///
/// The version is monotonic per application and is assigned by the storage
/// facade when the policy is stored, not by its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub version: u32,
    pub acls: Vec<Acl>,
}

impl Policy {
    pub fn new(acls: Vec<Acl>) -> Self {
        Policy { version: 0, acls }
    }

    /// Canonical wire encoding; the exact byte string exchanged with remotes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        canonical::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Policy> {
        canonical::decode(bytes)
    }
}
