//! The claim protocol: one-shot trust bootstrap of a remote application.

use std::future::Future;
use std::sync::Arc;

use busguard_core::{
    ClaimState, Error, IdentityInfo, Manifest, OnlineApplication, Result,
};
use busguard_storage::{AgentRegistration, AgentStorage};

use crate::proxy::{RemoteAppProxy, RPC_TIMEOUT};
use crate::registry::AppRegistry;

/// Approves or rejects a remote application's manifest before it is claimed.
pub trait ManifestListener: Send + Sync {
    fn approve_manifest(&self, app: &OnlineApplication, manifest: &Manifest) -> bool;
}

/// Runs one claim attempt end to end.
pub(crate) struct ClaimDriver {
    storage: Arc<AgentStorage>,
    proxy: Arc<dyn RemoteAppProxy>,
    registry: Arc<AppRegistry>,
}

impl ClaimDriver {
    pub fn new(
        storage: Arc<AgentStorage>,
        proxy: Arc<dyn RemoteAppProxy>,
        registry: Arc<AppRegistry>,
    ) -> Self {
        ClaimDriver {
            storage,
            proxy,
            registry,
        }
    }

    /// Claim a remote application under the given identity.
    ///
    /// The application row, identity certificate, and manifest are committed
    /// before the bus-level claim is published. If the claim message
    /// succeeds but its reply is lost, the remote ends up claimed with
    /// certificates the store already holds and the next reconciliation
    /// finds consistent state; the inverse ordering would leak unclaimed
    /// store-blessed identities on retry.
    pub async fn claim(
        &self,
        app: &OnlineApplication,
        identity: &IdentityInfo,
        listener: &dyn ManifestListener,
    ) -> Result<()> {
        let Some(target) = self.registry.get(&app.app.public_key) else {
            return Err(Error::UnknownApplication);
        };

        // Fetch the manifest template over an anonymous session and put it
        // in front of the listener.
        let manifest = call(self.proxy.get_manifest_template(&target)).await?;
        if !listener.approve_manifest(&target, &manifest) {
            tracing::info!(bus_name = %target.bus_name, "manifest rejected by listener");
            let _ = call(self.proxy.reset(&target)).await;
            return Err(Error::ManifestRejected("listener rejected manifest".into()));
        }

        // Commit locally before publishing.
        let (admin_group, identity_cert) =
            match self.storage.new_application(&target.app, identity, &manifest) {
                Ok(committed) => committed,
                Err(Error::AlreadyExists) => {
                    return Err(Error::PermissionDenied(
                        "application is already claimed".into(),
                    ));
                }
                Err(e) => return Err(e),
            };
        let ca_info = self.storage.ca().public_key_info()?;

        // Publish the claim.
        if let Err(e) = call(self.proxy.claim(
            &target,
            &ca_info,
            &admin_group,
            std::slice::from_ref(&identity_cert),
            &manifest,
        ))
        .await
        {
            tracing::warn!(bus_name = %target.bus_name, %e, "remote claim failed");
            self.storage.discard_application(&target.app);
            return Err(e);
        }

        self.registry
            .set_claim_state(&target.app.public_key, ClaimState::Claimed);
        tracing::info!(bus_name = %target.bus_name, aki = %target.app.aki, "application claimed");
        Ok(())
    }

    /// Publish a claim for an application whose certificates were already
    /// minted by `register_agent` (self-claiming). No store rows are
    /// written; the agent's own credentials live in the local key store.
    pub async fn claim_registered(
        &self,
        app: &OnlineApplication,
        registration: &AgentRegistration,
        manifest: &Manifest,
    ) -> Result<()> {
        let ca_info = self.storage.ca().public_key_info()?;
        call(self.proxy.claim(
            app,
            &ca_info,
            &registration.admin_group,
            &registration.identity_certs,
            manifest,
        ))
        .await
    }
}

async fn call<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(RPC_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}
