//! State reconciliation.
//!
//! A single worker task consumes security events and converges each online
//! application with its stored desired configuration: policy first, then
//! membership certificates, then the identity certificate. A new policy may
//! deny the agent's previous credentials, so credentials follow it; identity
//! goes last so an application lost mid-push still matches the older policy
//! and memberships. Failures never retry on their own: they surface as
//! `SyncError` notifications and the next event re-enters the loop.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use busguard_core::{Application, ClaimState, Error, OnlineApplication, Result};
use busguard_storage::{AgentStorage, StorageListener};

use crate::events::{ListenerHub, SyncError, SyncErrorKind};
use crate::monitor::{AppMonitor, StateAnnouncement};
use crate::proxy::{RemoteAppProxy, RPC_TIMEOUT};
use crate::registry::AppRegistry;

/// One unit of reconciliation work: a state delta observed on the bus or a
/// synthetic event for a pending persisted change.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub old: Option<StateAnnouncement>,
    pub new: Option<StateAnnouncement>,
}

/// The reconciliation engine. Exactly one worker executes events, so
/// per-application update concurrency is one.
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
    tx: Mutex<Option<mpsc::UnboundedSender<SecurityEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ReconcilerInner {
    storage: Arc<AgentStorage>,
    proxy: Arc<dyn RemoteAppProxy>,
    registry: Arc<AppRegistry>,
    monitor: Arc<dyn AppMonitor>,
    hub: Arc<ListenerHub>,
}

impl Reconciler {
    pub fn start(
        storage: Arc<AgentStorage>,
        proxy: Arc<dyn RemoteAppProxy>,
        registry: Arc<AppRegistry>,
        monitor: Arc<dyn AppMonitor>,
        hub: Arc<ListenerHub>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SecurityEvent>();
        let inner = Arc::new(ReconcilerInner {
            storage,
            proxy,
            registry,
            monitor,
            hub,
        });
        let worker_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker_inner.handle_event(event).await;
            }
        });
        Arc::new(Reconciler {
            inner,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue an event for the worker. Dropped silently after `stop`.
    pub fn enqueue(&self, event: SecurityEvent) {
        if let Some(tx) = &*self.tx.lock() {
            let _ = tx.send(event);
        }
    }

    /// Refuse new events, drain the queue, and wait for the in-flight task.
    pub async fn stop(&self) {
        drop(self.tx.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Persisted pending changes feed the queue: one synthetic event per
/// application that is currently online.
impl StorageListener for Reconciler {
    fn on_pending_changes(&self, apps: &[Application]) {
        for app in apps {
            let Some(online) = self.inner.registry.get(&app.public_key) else {
                continue;
            };
            if !online.is_online() {
                continue;
            }
            // Confirm liveness with the monitor before queueing work.
            let Ok(announcement) = self.inner.monitor.application(&online.bus_name) else {
                continue;
            };
            self.enqueue(SecurityEvent {
                old: None,
                new: Some(announcement),
            });
        }
    }

    fn on_pending_changes_completed(&self, _apps: &[Application]) {}
}

impl ReconcilerInner {
    async fn handle_event(&self, event: SecurityEvent) {
        let Some(announcement) = event.new else {
            return;
        };
        // Nothing to converge on applications nobody has claimed yet.
        if matches!(
            announcement.state,
            ClaimState::Claimable | ClaimState::NotClaimable
        ) {
            return;
        }
        let app = OnlineApplication {
            app: Application::new(announcement.public_key),
            claim_state: announcement.state,
            bus_name: announcement.bus_name,
        };
        self.update_application(&app).await;
    }

    async fn update_application(&self, app: &OnlineApplication) {
        tracing::debug!(bus_name = %app.bus_name, "updating application");
        let managed = match self.storage.get_managed_application(&app.app.public_key) {
            Ok(managed) => managed,
            Err(Error::EndOfData) => {
                // Claimed remote with no persisted row: it was removed by an
                // administrator, push a reset.
                let _ = self.reset_application(app).await;
                return;
            }
            Err(e) => {
                self.report(app, SyncErrorKind::Storage, e);
                return;
            }
        };

        let result = async {
            self.update_policy(app).await?;
            self.update_memberships(app, &managed).await?;
            self.update_identity(app).await
        }
        .await;

        if result.is_ok() {
            tracing::debug!(bus_name = %app.bus_name, "updates completed");
            if let Err(e) = self.storage.updates_completed(&app.app.public_key) {
                self.report(app, SyncErrorKind::Storage, e);
            }
        }
    }

    async fn reset_application(&self, app: &OnlineApplication) -> Result<()> {
        tracing::debug!(bus_name = %app.bus_name, "resetting application");
        match self.call(self.proxy.reset(app)).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.report(app, SyncErrorKind::Reset, e)),
        }
    }

    async fn update_policy(&self, app: &OnlineApplication) -> Result<()> {
        let local = match self.storage.get_policy(&app.app.public_key) {
            Ok(policy) => policy,
            // No stored policy means there is nothing to push.
            Err(Error::EndOfData) => return Ok(()),
            Err(e) => return Err(self.report(app, SyncErrorKind::Storage, e)),
        };
        let remote = match self.call(self.proxy.get_policy(app)).await {
            Ok(policy) => policy,
            Err(e) => return Err(self.report(app, SyncErrorKind::Policy, e)),
        };
        if local.version == remote.version {
            tracing::debug!(version = local.version, "policy already up to date");
            return Ok(());
        }
        match self.call(self.proxy.update_policy(app, &local)).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.report(app, SyncErrorKind::Policy, e)),
        }
    }

    async fn update_memberships(
        &self,
        app: &OnlineApplication,
        managed: &Application,
    ) -> Result<()> {
        let certs = match self.storage.membership_certificates(managed) {
            Ok(certs) => certs,
            Err(e) => return Err(self.report(app, SyncErrorKind::Storage, e)),
        };
        tracing::debug!(count = certs.len(), "installing membership certificates");
        for cert in certs {
            let serial = cert.serial.clone();
            match self.call(self.proxy.install_membership(app, &[cert])).await {
                Ok(()) => {}
                // The remote already holds this certificate.
                Err(Error::DuplicateCertificate) => {
                    tracing::debug!(serial, "membership already installed");
                }
                Err(e) => return Err(self.report(app, SyncErrorKind::Membership, e)),
            }
        }
        Ok(())
    }

    async fn update_identity(&self, app: &OnlineApplication) -> Result<()> {
        let (stored_cert, manifest) = match self
            .storage
            .identity_certificate_and_manifest(&app.app.public_key)
        {
            Ok(pair) => pair,
            Err(e) => return Err(self.report(app, SyncErrorKind::Storage, e)),
        };
        let local_serial = match stored_cert.serial_number() {
            Ok(serial) => serial,
            Err(e) => return Err(self.report(app, SyncErrorKind::Identity, e)),
        };

        let remote_chain = match self.call(self.proxy.get_identity(app)).await {
            Ok(chain) => chain,
            Err(e) => return Err(self.report(app, SyncErrorKind::Identity, e)),
        };
        let remote_serial = remote_chain
            .first()
            .and_then(|cert| cert.serial_number().ok());

        if remote_serial == Some(local_serial) {
            tracing::debug!(serial = local_serial, "identity already up to date");
            return Ok(());
        }
        match self
            .call(self.proxy.update_identity(app, &[stored_cert], &manifest))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.report(app, SyncErrorKind::Identity, e)),
        }
    }

    /// Bound a remote call by the per-call RPC timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(RPC_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn report(&self, app: &OnlineApplication, kind: SyncErrorKind, error: Error) -> Error {
        tracing::warn!(bus_name = %app.bus_name, ?kind, %error, "sync step failed");
        self.hub.notify_sync_error(SyncError {
            app: app.clone(),
            kind,
            error: error.clone(),
        });
        error
    }
}
