//! Security groups and identities.

use serde::{Deserialize, Serialize};

use crate::guid::Guid;
use crate::keys::PublicKey;

/// A security group.
///
/// `(authority, guid)` is the compound key. An absent authority is
/// canonicalized to the local CA public key by the storage facade before any
/// persistence or lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub authority: Option<PublicKey>,
    pub guid: Guid,
    pub name: String,
    pub desc: String,
}

impl GroupInfo {
    pub fn new(guid: Guid, name: impl Into<String>, desc: impl Into<String>) -> Self {
        GroupInfo {
            authority: None,
            guid,
            name: name.into(),
            desc: desc.into(),
        }
    }
}

/// An identity that can be bound to applications through identity
/// certificates. Same compound key and authority canonicalization as groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub authority: Option<PublicKey>,
    pub guid: Guid,
    pub name: String,
}

impl IdentityInfo {
    pub fn new(guid: Guid, name: impl Into<String>) -> Self {
        IdentityInfo {
            authority: None,
            guid,
            name: name.into(),
        }
    }
}
