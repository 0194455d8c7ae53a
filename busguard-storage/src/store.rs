//! The persisted-store facade used by the agent and administrative callers.
//!
//! Layers three concerns over the raw SQL store: listener notification for
//! the reconciler, canonicalization of empty group/identity authorities to
//! the local CA key, and the `updates_pending` bookkeeping that ties desired
//! state to what has actually been pushed to remotes. Operations that mint
//! certificates compose the CA.

use std::sync::Arc;

use parking_lot::Mutex;

use busguard_core::{
    AppMetadata, Application, Certificate, Error, GroupInfo, IdentityCertificate, IdentityInfo,
    Manifest, MembershipCertificate, Policy, PublicKey, Result,
};

use crate::ca::CertificateAuthority;
use crate::sql::SqlStorage;

/// Observes persisted desired-state changes.
pub trait StorageListener: Send + Sync {
    /// Desired state changed for these applications; a push is pending.
    fn on_pending_changes(&self, apps: &[Application]);
    /// Pending changes for these applications were confirmed on the remote.
    fn on_pending_changes_completed(&self, apps: &[Application]);
}

pub struct AgentStorage {
    sql: Arc<SqlStorage>,
    ca: Arc<CertificateAuthority>,
    listeners: Mutex<Vec<Arc<dyn StorageListener>>>,
}

impl AgentStorage {
    pub fn new(sql: Arc<SqlStorage>, ca: Arc<CertificateAuthority>) -> Self {
        AgentStorage {
            sql,
            ca,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn sql(&self) -> &Arc<SqlStorage> {
        &self.sql
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    // ─── Listeners ───────────────────────────────────────────────────────

    pub fn register_listener(&self, listener: Arc<dyn StorageListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn StorageListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn notify(&self, app: &Application, completed: bool) {
        // Snapshot under the lock, dispatch outside it.
        let listeners = self.listeners.lock().clone();
        let apps = std::slice::from_ref(app);
        for listener in listeners {
            if completed {
                listener.on_pending_changes_completed(apps);
            } else {
                listener.on_pending_changes(apps);
            }
        }
    }

    // ─── Authority canonicalization ──────────────────────────────────────

    fn canonical_group(&self, group: &GroupInfo) -> Result<GroupInfo> {
        let mut group = group.clone();
        if group.authority.is_none() {
            group.authority = Some(self.ca.public_key_info()?.public_key);
        }
        Ok(group)
    }

    fn canonical_identity(&self, identity: &IdentityInfo) -> Result<IdentityInfo> {
        let mut identity = identity.clone();
        if identity.authority.is_none() {
            identity.authority = Some(self.ca.public_key_info()?.public_key);
        }
        Ok(identity)
    }

    // ─── Groups & identities ─────────────────────────────────────────────

    pub fn store_group(&self, group: &GroupInfo) -> Result<()> {
        self.sql.store_group(&self.canonical_group(group)?)
    }

    pub fn remove_group(&self, group: &GroupInfo) -> Result<()> {
        let group = self.canonical_group(group)?;
        let authority = group.authority.ok_or(Error::KeyUnavailable)?;
        self.sql.remove_group(&authority, &group.guid)
    }

    pub fn get_group(&self, group: &GroupInfo) -> Result<GroupInfo> {
        let group = self.canonical_group(group)?;
        let authority = group.authority.ok_or(Error::KeyUnavailable)?;
        self.sql.get_group(&authority, &group.guid)
    }

    pub fn get_groups(&self) -> Result<Vec<GroupInfo>> {
        self.sql.get_groups()
    }

    pub fn store_identity(&self, identity: &IdentityInfo) -> Result<()> {
        self.sql.store_identity(&self.canonical_identity(identity)?)
    }

    pub fn remove_identity(&self, identity: &IdentityInfo) -> Result<()> {
        let identity = self.canonical_identity(identity)?;
        let authority = identity.authority.ok_or(Error::KeyUnavailable)?;
        self.sql.remove_identity(&authority, &identity.guid)
    }

    pub fn get_identity(&self, identity: &IdentityInfo) -> Result<IdentityInfo> {
        let identity = self.canonical_identity(identity)?;
        let authority = identity.authority.ok_or(Error::KeyUnavailable)?;
        self.sql.get_identity(&authority, &identity.guid)
    }

    pub fn get_identities(&self) -> Result<Vec<IdentityInfo>> {
        self.sql.get_identities()
    }

    // ─── Applications ────────────────────────────────────────────────────

    pub fn get_managed_application(&self, key: &PublicKey) -> Result<Application> {
        self.sql.get_managed_application(key)
    }

    pub fn get_managed_applications(&self) -> Result<Vec<Application>> {
        self.sql.get_managed_applications()
    }

    pub fn set_app_metadata(&self, key: &PublicKey, meta: &AppMetadata) -> Result<()> {
        self.sql.set_app_metadata(key, meta)
    }

    pub fn get_app_metadata(&self, key: &PublicKey) -> Result<AppMetadata> {
        self.sql.get_app_metadata(key)
    }

    /// Remove a managed application. The outgoing row is reported as having
    /// updates pending so the reconciler pushes a reset to the remote.
    pub fn remove_application(&self, key: &PublicKey) -> Result<Application> {
        let mut app = self.sql.get_managed_application(key)?;
        self.sql.remove_application(&app)?;
        app.updates_pending = true;
        self.notify(&app, false);
        Ok(app)
    }

    /// Record that desired state changed for an application. Flips
    /// `updates_pending` at most once; already-pending applications are not
    /// re-notified.
    pub fn application_updated(&self, key: &PublicKey) -> Result<()> {
        let mut app = self.sql.get_managed_application(key)?;
        if !app.updates_pending {
            app.updates_pending = true;
            self.sql.store_application(&app, true)?;
            self.notify(&app, false);
        }
        Ok(())
    }

    /// Record that the remote now matches the stored configuration.
    pub fn updates_completed(&self, key: &PublicKey) -> Result<()> {
        match self.sql.get_managed_application(key) {
            Ok(mut app) => {
                if app.updates_pending {
                    app.updates_pending = false;
                    self.sql.store_application(&app, true)?;
                }
                self.notify(&app, true);
                Ok(())
            }
            // Row removed while the update was in flight; completion still
            // has to reach the listeners.
            Err(Error::EndOfData) => {
                let app = Application::new(*key);
                self.notify(&app, true);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ─── Desired-state mutations ─────────────────────────────────────────

    /// Mint a membership certificate placing the application in the group
    /// and persist it. The group must exist in storage.
    pub fn install_membership(&self, key: &PublicKey, group: &GroupInfo) -> Result<()> {
        let group = self.get_group(group)?;
        let app = self.sql.get_managed_application(key)?;
        let cert = self.ca.mint_membership(&app, &group)?;
        self.sql
            .store_certificate(&Certificate::Membership(cert), false)?;
        self.application_updated(key)
    }

    /// Remove the application's membership certificate for the group.
    pub fn remove_membership(&self, key: &PublicKey, group: &GroupInfo) -> Result<()> {
        let group = self.canonical_group(group)?;
        let app = self.sql.get_managed_application(key)?;
        let cert = self
            .sql
            .get_membership_certificate(&app.public_key, &group.guid)?;
        self.sql
            .remove_certificate(&Certificate::Membership(cert))?;
        self.application_updated(key)
    }

    /// Store a new policy for the application. The stored version is the
    /// current version plus one, regardless of the version on the input.
    pub fn update_policy(&self, key: &PublicKey, policy: &Policy) -> Result<()> {
        self.sql.get_managed_application(key)?;
        let current_version = match self.sql.get_policy(key) {
            Ok(existing) => existing.version,
            Err(Error::EndOfData) => 0,
            Err(e) => return Err(e),
        };
        let mut policy = policy.clone();
        policy.version = current_version + 1;
        self.sql.store_policy(key, &policy)?;
        self.application_updated(key)
    }

    pub fn get_policy(&self, key: &PublicKey) -> Result<Policy> {
        self.sql.get_policy(key)
    }

    pub fn get_manifest(&self, key: &PublicKey) -> Result<Manifest> {
        self.sql.get_manifest(key)
    }

    /// Re-mint the application's identity certificate for a new identity,
    /// bound to the digest of the manifest already in storage.
    pub fn update_identity(&self, key: &PublicKey, identity: &IdentityInfo) -> Result<()> {
        let app = self.sql.get_managed_application(key)?;
        let manifest = self.sql.get_manifest(key)?;
        let cert = self.ca.mint_identity(&app, identity, &manifest)?;
        self.sql
            .store_certificate(&Certificate::Identity(cert), true)?;
        self.application_updated(key)
    }

    /// The stored identity certificate and manifest, as pushed by the
    /// reconciler.
    pub fn identity_certificate_and_manifest(
        &self,
        key: &PublicKey,
    ) -> Result<(IdentityCertificate, Manifest)> {
        self.sql.get_managed_application(key)?;
        let cert = self.sql.get_identity_certificate(key)?;
        let manifest = self.sql.get_manifest(key)?;
        Ok((cert, manifest))
    }

    /// Stored membership certificates for an application, normalized and
    /// re-signed for push.
    pub fn membership_certificates(
        &self,
        app: &Application,
    ) -> Result<Vec<MembershipCertificate>> {
        self.ca.membership_certificates(app)
    }

    // ─── Claim protocol hooks ────────────────────────────────────────────

    /// Transactionally create an application row together with its identity
    /// certificate and manifest. Either all three commit or none do; a
    /// conflict on the application row surfaces as `AlreadyExists`.
    ///
    /// The certificate is minted before the transaction opens because serial
    /// allocation uses its own transaction; an allocated serial is simply
    /// never reused if the commit fails.
    pub fn new_application(
        &self,
        app: &Application,
        identity: &IdentityInfo,
        manifest: &Manifest,
    ) -> Result<(GroupInfo, IdentityCertificate)> {
        let admin_group = self.ca.admin_group()?;
        let cert = self.ca.mint_identity(app, identity, manifest)?;
        self.sql.transaction(|tx| {
            tx.store_application(app, false)?;
            tx.store_certificate(&Certificate::Identity(cert.clone()), false)?;
            tx.store_manifest(&app.public_key, manifest)?;
            Ok(())
        })?;
        Ok((admin_group, cert))
    }

    /// Drop the rows committed for a claim attempt whose bus-level claim
    /// failed. No pending-change notification: the remote never learned of
    /// this application.
    pub fn discard_application(&self, app: &Application) {
        if let Err(e) = self.sql.remove_application(app) {
            tracing::warn!(aki = %app.aki, %e, "failed to discard application after claim failure");
        }
    }
}
