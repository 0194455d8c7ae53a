//! The security agent facade.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use busguard_core::{
    Acl, ActionMask, Application, ClaimState, Error, Guid, IdentityInfo, KeyInfo, Manifest,
    MemberType, MembershipCertificate, OnlineApplication, PeerSpec, Policy, PublicKey, Result,
    Rule, RuleMember,
};
use busguard_storage::{AgentStorage, CertificateAuthority, SqlStorage, StorageListener};

use crate::claim::{ClaimDriver, ManifestListener};
use crate::config::AgentConfig;
use crate::events::{ApplicationListener, ListenerHub};
use crate::monitor::{AppMonitor, SecurityStateListener, StateAnnouncement};
use crate::proxy::RemoteAppProxy;
use crate::registry::AppRegistry;
use crate::updater::{Reconciler, SecurityEvent};

/// Capabilities of the agent's own bus attachment: the local permission
/// configurator and the local credential store used during self-claiming.
pub trait LocalBus: Send + Sync {
    fn application_state(&self) -> Result<ClaimState>;

    fn public_key(&self) -> Result<PublicKey>;

    fn unique_bus_name(&self) -> String;

    /// Persist the agent's own policy into the local key store.
    fn store_local_policy(&self, policy: &Policy) -> Result<()>;

    /// Persist the agent's own admin-group membership chain.
    fn store_local_membership(&self, chain: &[MembershipCertificate]) -> Result<()>;
}

/// Wires storage, CA, monitor, and proxy into a running [`SecurityAgent`].
#[derive(Default)]
pub struct SecurityAgentBuilder {
    config: Option<AgentConfig>,
    sql: Option<Arc<SqlStorage>>,
    monitor: Option<Arc<dyn AppMonitor>>,
    proxy: Option<Arc<dyn RemoteAppProxy>>,
    local_bus: Option<Arc<dyn LocalBus>>,
}

impl SecurityAgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an already-open storage handle instead of opening one from the
    /// configured path.
    pub fn sql_storage(mut self, sql: Arc<SqlStorage>) -> Self {
        self.sql = Some(sql);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn AppMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn proxy(mut self, proxy: Arc<dyn RemoteAppProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn local_bus(mut self, local_bus: Arc<dyn LocalBus>) -> Self {
        self.local_bus = Some(local_bus);
        self
    }

    /// Build and initialize the agent: open storage and the CA, claim the
    /// local attachment if it is still claimable, load managed applications,
    /// and subscribe the reconciler to storage and monitor events.
    pub async fn build(self) -> anyhow::Result<Arc<SecurityAgent>> {
        let sql = match (self.sql, &self.config) {
            (Some(sql), _) => sql,
            (None, Some(config)) => Arc::new(
                SqlStorage::open(&config.storage_path).context("opening security state store")?,
            ),
            (None, None) => anyhow::bail!("a storage handle or a configuration is required"),
        };
        let monitor = self.monitor.context("an application monitor is required")?;
        let proxy = self.proxy.context("a remote application proxy is required")?;
        let local_bus = self.local_bus.context("a local bus attachment is required")?;
        let agent_name = self
            .config
            .map(|config| config.agent_name)
            .unwrap_or_else(|| "Admin".into());

        let ca = Arc::new(CertificateAuthority::open(Arc::clone(&sql))?);
        let storage = Arc::new(AgentStorage::new(sql, ca));
        let public_key_info = storage.ca().public_key_info()?;

        let hub = ListenerHub::start();
        let registry = Arc::new(AppRegistry::new(Arc::clone(&hub)));
        let reconciler = Reconciler::start(
            Arc::clone(&storage),
            Arc::clone(&proxy),
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&hub),
        );
        let claim_driver = ClaimDriver::new(
            Arc::clone(&storage),
            Arc::clone(&proxy),
            Arc::clone(&registry),
        );

        let monitor_hook: Arc<dyn SecurityStateListener> = Arc::new(MonitorHook {
            registry: Arc::clone(&registry),
            reconciler: Arc::clone(&reconciler),
        });
        let registry_hook: Arc<dyn StorageListener> = Arc::new(RegistryHook {
            registry: Arc::clone(&registry),
        });

        let agent = Arc::new(SecurityAgent {
            storage,
            registry,
            reconciler,
            hub,
            monitor,
            local_bus,
            claim_driver,
            manifest_listener: Mutex::new(None),
            public_key_info,
            monitor_hook,
            registry_hook,
            agent_identity: IdentityInfo::new(Guid::filled(0xab), agent_name),
        });
        agent.init().await?;
        Ok(agent)
    }
}

/// The public entry point of the security management agent.
pub struct SecurityAgent {
    storage: Arc<AgentStorage>,
    registry: Arc<AppRegistry>,
    reconciler: Arc<Reconciler>,
    hub: Arc<ListenerHub>,
    monitor: Arc<dyn AppMonitor>,
    local_bus: Arc<dyn LocalBus>,
    claim_driver: ClaimDriver,
    manifest_listener: Mutex<Option<Arc<dyn ManifestListener>>>,
    public_key_info: KeyInfo,
    monitor_hook: Arc<dyn SecurityStateListener>,
    registry_hook: Arc<dyn StorageListener>,
    agent_identity: IdentityInfo,
}

impl SecurityAgent {
    async fn init(&self) -> Result<()> {
        if self.local_bus.application_state()? == ClaimState::Claimable {
            self.claim_self().await?;
        }

        self.registry
            .set_own_bus_name(&self.local_bus.unique_bus_name());
        for app in self.storage.get_managed_applications()? {
            self.registry.seed(app);
        }

        self.storage
            .register_listener(Arc::clone(&self.reconciler) as Arc<dyn StorageListener>);
        self.storage.register_listener(Arc::clone(&self.registry_hook));
        self.monitor.register_listener(Arc::clone(&self.monitor_hook));
        tracing::info!(aki = %self.public_key_info.aki, "security agent initialized");
        Ok(())
    }

    /// Claim the agent's own bus attachment: generate the agent manifest,
    /// policy, identity, and admin-group membership, claim over the bus, and
    /// persist the local credentials.
    async fn claim_self(&self) -> Result<()> {
        tracing::info!("local attachment is claimable, claiming self");

        let manifest = Manifest::from_rules(vec![Rule::wildcard(
            MemberType::Any,
            ActionMask::PROVIDE | ActionMask::MODIFY | ActionMask::OBSERVE,
        )])?;

        // Any trusted peer may call methods, use properties, and receive
        // signals.
        let mut policy = Policy::new(vec![Acl {
            peers: vec![PeerSpec::AnyTrusted],
            rules: vec![Rule {
                interface: "*".into(),
                members: vec![
                    RuleMember {
                        name: "*".into(),
                        member_type: MemberType::Method,
                        actions: ActionMask::PROVIDE | ActionMask::MODIFY,
                    },
                    RuleMember {
                        name: "*".into(),
                        member_type: MemberType::Property,
                        actions: ActionMask::PROVIDE | ActionMask::MODIFY | ActionMask::OBSERVE,
                    },
                    RuleMember {
                        name: "*".into(),
                        member_type: MemberType::Signal,
                        actions: ActionMask::PROVIDE | ActionMask::OBSERVE,
                    },
                ],
            }],
        }]);
        policy.version = 1;

        let own_key = self.local_bus.public_key()?;
        let registration =
            self.storage
                .ca()
                .register_agent(&self.agent_identity, &own_key, &manifest)?;

        let own_app = OnlineApplication {
            app: Application::new(own_key),
            claim_state: ClaimState::Claimable,
            bus_name: self.local_bus.unique_bus_name(),
        };
        self.claim_driver
            .claim_registered(&own_app, &registration, &manifest)
            .await?;

        self.local_bus.store_local_policy(&policy)?;
        let membership = registration
            .memberships
            .first()
            .ok_or(Error::EndOfData)?;
        self.local_bus.store_local_membership(membership)?;
        tracing::info!("agent claimed itself into the admin group");
        Ok(())
    }

    // ─── Facade operations ───────────────────────────────────────────────

    /// Claim a remote application under the given identity. Requires a
    /// manifest listener.
    pub async fn claim(&self, app: &OnlineApplication, identity: &IdentityInfo) -> Result<()> {
        let listener = self
            .manifest_listener
            .lock()
            .clone()
            .ok_or_else(|| Error::ManifestRejected("no manifest listener installed".into()))?;
        self.claim_driver
            .claim(app, identity, listener.as_ref())
            .await
    }

    pub fn get_application(&self, key: &PublicKey) -> Result<OnlineApplication> {
        self.registry.get(key).ok_or(Error::EndOfData)
    }

    pub fn get_applications(&self, filter: Option<ClaimState>) -> Vec<OnlineApplication> {
        self.registry.list(filter)
    }

    /// Queue reconciliation for the given applications, or for every claimed
    /// application when `None`.
    pub fn sync_with_applications(&self, apps: Option<&[OnlineApplication]>) {
        let selection = match apps {
            None => self.registry.list(Some(ClaimState::Claimed)),
            Some(apps) => apps
                .iter()
                .filter_map(|app| self.registry.get(&app.app.public_key))
                .collect(),
        };
        for app in selection {
            if app.claim_state != ClaimState::Claimed || !app.is_online() {
                continue;
            }
            self.reconciler.enqueue(SecurityEvent {
                old: None,
                new: Some(StateAnnouncement {
                    bus_name: app.bus_name.clone(),
                    public_key: app.app.public_key,
                    state: app.claim_state,
                }),
            });
        }
    }

    pub fn register_application_listener(&self, listener: Arc<dyn ApplicationListener>) {
        self.hub.register(listener);
    }

    pub fn unregister_application_listener(&self, listener: &Arc<dyn ApplicationListener>) {
        self.hub.unregister(listener);
    }

    pub fn set_manifest_listener(&self, listener: Option<Arc<dyn ManifestListener>>) {
        *self.manifest_listener.lock() = listener;
    }

    pub fn public_key_info(&self) -> &KeyInfo {
        &self.public_key_info
    }

    /// The persisted-store facade, for administrative CRUD on groups,
    /// identities, policies, and memberships.
    pub fn storage(&self) -> &Arc<AgentStorage> {
        &self.storage
    }

    /// Unsubscribe from events, stop the reconciliation queue, and drain the
    /// listener dispatcher.
    pub async fn shutdown(&self) {
        self.monitor.unregister_listener(&self.monitor_hook);
        self.storage
            .unregister_listener(&(Arc::clone(&self.reconciler) as Arc<dyn StorageListener>));
        self.storage.unregister_listener(&self.registry_hook);
        self.reconciler.stop().await;
        self.hub.shutdown().await;
        tracing::info!("security agent shut down");
    }
}

/// Feeds monitor announcements into the registry and the reconciliation
/// queue.
struct MonitorHook {
    registry: Arc<AppRegistry>,
    reconciler: Arc<Reconciler>,
}

impl SecurityStateListener for MonitorHook {
    fn on_state_change(&self, old: Option<&StateAnnouncement>, new: Option<&StateAnnouncement>) {
        match (old, new) {
            (_, Some(announcement)) => {
                if !self.registry.observe_announcement(announcement) {
                    return;
                }
                self.reconciler.enqueue(SecurityEvent {
                    old: old.cloned(),
                    new: Some(announcement.clone()),
                });
            }
            (Some(announcement), None) => {
                self.registry.observe_lost(&announcement.bus_name);
            }
            (None, None) => {}
        }
    }
}

/// Mirrors persisted pending-flag transitions into the registry, which in
/// turn notifies application listeners of the before/after pair.
struct RegistryHook {
    registry: Arc<AppRegistry>,
}

impl StorageListener for RegistryHook {
    fn on_pending_changes(&self, apps: &[Application]) {
        for app in apps {
            self.registry.set_updates_pending(&app.public_key, true);
        }
    }

    fn on_pending_changes_completed(&self, apps: &[Application]) {
        for app in apps {
            self.registry.set_updates_pending(&app.public_key, false);
        }
    }
}
