//! Per-application remote operations.

use std::time::Duration;

use async_trait::async_trait;

use busguard_core::{
    GroupInfo, IdentityCertificate, KeyInfo, Manifest, MembershipCertificate, OnlineApplication,
    Policy, Result,
};

/// Hard upper bound on any single bus call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// The bus-level operations the agent performs against remote applications.
///
/// Implementations own session management: `claim` and
/// `get_manifest_template` run over an anonymous ECDHE session, everything
/// else over an ECDSA-authenticated one. Sessions allow one outstanding
/// operation and live for the duration of a single call.
#[async_trait]
pub trait RemoteAppProxy: Send + Sync {
    /// Transition a claimable application to claimed under the given CA,
    /// installing the admin group, the identity certificate chain, and the
    /// signed manifest.
    async fn claim(
        &self,
        app: &OnlineApplication,
        ca: &KeyInfo,
        admin_group: &GroupInfo,
        identity_chain: &[IdentityCertificate],
        manifest: &Manifest,
    ) -> Result<()>;

    async fn get_identity(&self, app: &OnlineApplication) -> Result<Vec<IdentityCertificate>>;

    async fn update_identity(
        &self,
        app: &OnlineApplication,
        identity_chain: &[IdentityCertificate],
        manifest: &Manifest,
    ) -> Result<()>;

    /// `DuplicateCertificate` when the remote already holds the chain.
    async fn install_membership(
        &self,
        app: &OnlineApplication,
        chain: &[MembershipCertificate],
    ) -> Result<()>;

    async fn update_policy(&self, app: &OnlineApplication, policy: &Policy) -> Result<()>;

    async fn get_policy(&self, app: &OnlineApplication) -> Result<Policy>;

    async fn get_manifest_template(&self, app: &OnlineApplication) -> Result<Manifest>;

    /// Wipe the remote's security state, returning it to claimable.
    async fn reset(&self, app: &OnlineApplication) -> Result<()>;
}
