//! Permission manifests.

use crate::canonical;
use crate::error::{Error, Result};
use crate::rules::Rule;

/// The set of permission rules a remote application declares it needs.
///
/// A manifest holds both representations at once: the rule list and its
/// canonical byte encoding, coherent by construction. The SHA-256 digest over
/// the canonical bytes is what gets signed into identity certificates, so two
/// manifests are equal iff their canonical bytes are equal.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    rules: Vec<Rule>,
    bytes: Vec<u8>,
}

impl Manifest {
    pub fn empty() -> Self {
        Manifest::default()
    }

    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        if rules.is_empty() {
            return Ok(Manifest::default());
        }
        let bytes = canonical::encode(&rules)?;
        Ok(Manifest { rules, bytes })
    }

    /// Rebuild a manifest from its byte encoding. The bytes are re-encoded
    /// after decoding so the held representation is always canonical.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Manifest::default());
        }
        let rules: Vec<Rule> = canonical::decode(bytes)?;
        Manifest::from_rules(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Canonical byte encoding. `EndOfData` on an empty manifest.
    pub fn bytes(&self) -> Result<&[u8]> {
        if self.is_empty() {
            return Err(Error::EndOfData);
        }
        Ok(&self.bytes)
    }

    /// The rule list. `EndOfData` on an empty manifest.
    pub fn rules(&self) -> Result<&[Rule]> {
        if self.is_empty() {
            return Err(Error::EndOfData);
        }
        Ok(&self.rules)
    }

    /// SHA-256 over the canonical bytes. `EndOfData` on an empty manifest.
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(canonical::digest(self.bytes()?))
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Manifest {}
