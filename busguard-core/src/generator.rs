//! Default policy generation.

use crate::error::{Error, Result};
use crate::group::GroupInfo;
use crate::policy::{Acl, PeerSpec, Policy};
use crate::rules::{ActionMask, MemberType, Rule};

/// Generates the default policy for a set of groups: each group's members may
/// provide any interface to the application and modify any interface the
/// application provides.
pub struct PolicyGenerator;

impl PolicyGenerator {
    /// One ACL per group, in input order. Groups must carry their authority
    /// (i.e. come from storage, where empty authorities are canonicalized);
    /// a group without one fails with `KeyUnavailable`. The version of the
    /// returned policy is 0 and is assigned when the policy is stored.
    pub fn default_policy(groups: &[GroupInfo]) -> Result<Policy> {
        let acls = groups
            .iter()
            .map(Self::group_acl)
            .collect::<Result<Vec<_>>>()?;
        Ok(Policy::new(acls))
    }

    fn group_acl(group: &GroupInfo) -> Result<Acl> {
        let authority = group.authority.ok_or(Error::KeyUnavailable)?;
        Ok(Acl {
            peers: vec![PeerSpec::WithMembership {
                authority,
                group: group.guid,
            }],
            rules: vec![Rule::wildcard(
                MemberType::Any,
                ActionMask::PROVIDE | ActionMask::MODIFY,
            )],
        })
    }
}
