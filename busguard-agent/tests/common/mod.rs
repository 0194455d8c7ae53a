//! Shared fakes for driving the agent without a real bus.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use busguard_agent::{
    AppMonitor, ApplicationListener, ManifestListener, RemoteAppProxy, SecurityAgent,
    SecurityAgentBuilder, SecurityStateListener, StateAnnouncement, SyncError,
};
pub use busguard_agent::LocalBus;
use busguard_core::{
    ActionMask, ClaimState, Error, GroupInfo, IdentityCertificate, IdentityInfo, KeyInfo,
    Manifest, MemberType, MembershipCertificate, OnlineApplication, Policy, PublicKey, Result,
    Rule,
};
use busguard_storage::SqlStorage;

pub fn new_key() -> PublicKey {
    let signing_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    PublicKey::from_verifying_key(signing_key.verifying_key())
}

pub fn template_manifest() -> Manifest {
    Manifest::from_rules(vec![Rule::wildcard(
        MemberType::Any,
        ActionMask::PROVIDE | ActionMask::MODIFY,
    )])
    .expect("template manifest")
}

/// Poll until `cond` holds; panics after five seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

// ─── Monitor ─────────────────────────────────────────────────────────────

/// A scriptable announcement layer.
pub struct FakeMonitor {
    listeners: Mutex<Vec<Arc<dyn SecurityStateListener>>>,
    live: Mutex<HashMap<String, StateAnnouncement>>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeMonitor {
            listeners: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Announce an application and deliver the delta to all listeners.
    pub fn announce(&self, bus_name: &str, public_key: PublicKey, state: ClaimState) {
        let new = StateAnnouncement {
            bus_name: bus_name.into(),
            public_key,
            state,
        };
        let old = self.live.lock().insert(bus_name.to_string(), new.clone());
        for listener in self.listeners.lock().clone() {
            listener.on_state_change(old.as_ref(), Some(&new));
        }
    }

    /// Drop an application from the bus.
    pub fn lose(&self, bus_name: &str) {
        let Some(old) = self.live.lock().remove(bus_name) else {
            return;
        };
        for listener in self.listeners.lock().clone() {
            listener.on_state_change(Some(&old), None);
        }
    }
}

impl AppMonitor for FakeMonitor {
    fn register_listener(&self, listener: Arc<dyn SecurityStateListener>) {
        self.listeners.lock().push(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn SecurityStateListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn application(&self, bus_name: &str) -> Result<StateAnnouncement> {
        self.live
            .lock()
            .get(bus_name)
            .cloned()
            .ok_or(Error::EndOfData)
    }
}

// ─── Remote proxy ────────────────────────────────────────────────────────

/// One remote application's security state, keyed by bus name.
#[derive(Default)]
pub struct RemoteState {
    pub claimed: bool,
    pub policy: Option<Policy>,
    pub memberships: Vec<MembershipCertificate>,
    pub identity: Vec<IdentityCertificate>,
    pub manifest: Option<Manifest>,
    pub reset_count: usize,
    pub claim_count: usize,
}

/// A scriptable bus proxy.
pub struct FakeRemote {
    apps: Mutex<HashMap<String, RemoteState>>,
    manifest_template: Mutex<Manifest>,
    offline: AtomicBool,
    fail_claim: AtomicBool,
}

impl FakeRemote {
    pub fn new(manifest_template: Manifest) -> Arc<Self> {
        Arc::new(FakeRemote {
            apps: Mutex::new(HashMap::new()),
            manifest_template: Mutex::new(manifest_template),
            offline: AtomicBool::new(false),
            fail_claim: AtomicBool::new(false),
        })
    }

    /// While offline, every operation fails with `RemoteUnreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail only the claim operation, after the session-level calls
    /// succeeded.
    pub fn set_fail_claim(&self, fail: bool) {
        self.fail_claim.store(fail, Ordering::SeqCst);
    }

    /// Inspect the state of one remote application.
    pub fn state<T>(&self, bus_name: &str, inspect: impl FnOnce(&RemoteState) -> T) -> T {
        let mut apps = self.apps.lock();
        inspect(apps.entry(bus_name.to_string()).or_default())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnreachable("fake remote offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAppProxy for FakeRemote {
    async fn claim(
        &self,
        app: &OnlineApplication,
        _ca: &KeyInfo,
        _admin_group: &GroupInfo,
        identity_chain: &[IdentityCertificate],
        manifest: &Manifest,
    ) -> Result<()> {
        self.check_online()?;
        if self.fail_claim.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnreachable("claim reply lost".into()));
        }
        let mut apps = self.apps.lock();
        let state = apps.entry(app.bus_name.clone()).or_default();
        if state.claimed {
            return Err(Error::PermissionDenied("already claimed".into()));
        }
        state.claimed = true;
        state.claim_count += 1;
        state.identity = identity_chain.to_vec();
        state.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn get_identity(&self, app: &OnlineApplication) -> Result<Vec<IdentityCertificate>> {
        self.check_online()?;
        Ok(self
            .apps
            .lock()
            .get(&app.bus_name)
            .map(|state| state.identity.clone())
            .unwrap_or_default())
    }

    async fn update_identity(
        &self,
        app: &OnlineApplication,
        identity_chain: &[IdentityCertificate],
        manifest: &Manifest,
    ) -> Result<()> {
        self.check_online()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.bus_name.clone()).or_default();
        state.identity = identity_chain.to_vec();
        state.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn install_membership(
        &self,
        app: &OnlineApplication,
        chain: &[MembershipCertificate],
    ) -> Result<()> {
        self.check_online()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.bus_name.clone()).or_default();
        for cert in chain {
            if state.memberships.iter().any(|held| held.serial == cert.serial) {
                return Err(Error::DuplicateCertificate);
            }
            state.memberships.push(cert.clone());
        }
        Ok(())
    }

    async fn update_policy(&self, app: &OnlineApplication, policy: &Policy) -> Result<()> {
        self.check_online()?;
        let mut apps = self.apps.lock();
        apps.entry(app.bus_name.clone()).or_default().policy = Some(policy.clone());
        Ok(())
    }

    async fn get_policy(&self, app: &OnlineApplication) -> Result<Policy> {
        self.check_online()?;
        Ok(self
            .apps
            .lock()
            .get(&app.bus_name)
            .and_then(|state| state.policy.clone())
            .unwrap_or(Policy {
                version: 0,
                acls: vec![],
            }))
    }

    async fn get_manifest_template(&self, _app: &OnlineApplication) -> Result<Manifest> {
        self.check_online()?;
        Ok(self.manifest_template.lock().clone())
    }

    async fn reset(&self, app: &OnlineApplication) -> Result<()> {
        self.check_online()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.bus_name.clone()).or_default();
        let reset_count = state.reset_count + 1;
        *state = RemoteState {
            reset_count,
            ..RemoteState::default()
        };
        Ok(())
    }
}

// ─── Local bus ───────────────────────────────────────────────────────────

/// A fake own-bus attachment with an in-memory credential store.
pub struct FakeLocalBus {
    state: Mutex<ClaimState>,
    key: PublicKey,
    bus_name: String,
    pub stored_policy: Mutex<Option<Policy>>,
    pub stored_memberships: Mutex<Vec<MembershipCertificate>>,
}

impl FakeLocalBus {
    pub fn with_state(bus_name: &str, state: ClaimState) -> Arc<Self> {
        Arc::new(FakeLocalBus {
            state: Mutex::new(state),
            key: new_key(),
            bus_name: bus_name.into(),
            stored_policy: Mutex::new(None),
            stored_memberships: Mutex::new(Vec::new()),
        })
    }

    /// An attachment that was claimed in an earlier run.
    pub fn claimed(bus_name: &str) -> Arc<Self> {
        Self::with_state(bus_name, ClaimState::Claimed)
    }

    /// A freshly started attachment that still needs self-claiming.
    pub fn claimable(bus_name: &str) -> Arc<Self> {
        Self::with_state(bus_name, ClaimState::Claimable)
    }
}

impl LocalBus for FakeLocalBus {
    fn application_state(&self) -> Result<ClaimState> {
        Ok(*self.state.lock())
    }

    fn public_key(&self) -> Result<PublicKey> {
        Ok(self.key)
    }

    fn unique_bus_name(&self) -> String {
        self.bus_name.clone()
    }

    fn store_local_policy(&self, policy: &Policy) -> Result<()> {
        *self.stored_policy.lock() = Some(policy.clone());
        Ok(())
    }

    fn store_local_membership(&self, chain: &[MembershipCertificate]) -> Result<()> {
        self.stored_memberships.lock().extend(chain.iter().cloned());
        *self.state.lock() = ClaimState::Claimed;
        Ok(())
    }
}

// ─── Listeners ───────────────────────────────────────────────────────────

/// A manifest listener with a fixed verdict that records what it saw.
pub struct StaticManifestListener {
    approve: bool,
    pub seen: Mutex<Vec<Manifest>>,
}

impl StaticManifestListener {
    pub fn approving() -> Arc<Self> {
        Arc::new(StaticManifestListener {
            approve: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(StaticManifestListener {
            approve: false,
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl ManifestListener for StaticManifestListener {
    fn approve_manifest(&self, _app: &OnlineApplication, manifest: &Manifest) -> bool {
        self.seen.lock().push(manifest.clone());
        self.approve
    }
}

/// Records every application listener callback.
pub struct RecordingListener {
    pub transitions: Mutex<Vec<(Option<OnlineApplication>, Option<OnlineApplication>)>>,
    pub sync_errors: Mutex<Vec<SyncError>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener {
            transitions: Mutex::new(Vec::new()),
            sync_errors: Mutex::new(Vec::new()),
        })
    }

    /// The `updates_pending` flips seen for one application, in order.
    pub fn pending_flags_for(&self, key: &PublicKey) -> Vec<bool> {
        self.transitions
            .lock()
            .iter()
            .filter_map(|(old, new)| {
                let (old, new) = (old.as_ref()?, new.as_ref()?);
                if new.app.public_key != *key {
                    return None;
                }
                (old.app.updates_pending != new.app.updates_pending)
                    .then_some(new.app.updates_pending)
            })
            .collect()
    }
}

impl ApplicationListener for RecordingListener {
    fn on_application_state_change(
        &self,
        old: Option<&OnlineApplication>,
        new: Option<&OnlineApplication>,
    ) {
        self.transitions.lock().push((old.cloned(), new.cloned()));
    }

    fn on_sync_error(&self, error: &SyncError) {
        self.sync_errors.lock().push(error.clone());
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────

pub struct TestHarness {
    pub agent: Arc<SecurityAgent>,
    pub monitor: Arc<FakeMonitor>,
    pub remote: Arc<FakeRemote>,
    pub local_bus: Arc<FakeLocalBus>,
}

pub async fn harness() -> TestHarness {
    harness_with(FakeLocalBus::claimed("bus.agent")).await
}

pub async fn harness_with(local_bus: Arc<FakeLocalBus>) -> TestHarness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let monitor = FakeMonitor::new();
    let remote = FakeRemote::new(template_manifest());
    let agent = SecurityAgentBuilder::new()
        .sql_storage(Arc::new(SqlStorage::open_in_memory().expect("open store")))
        .monitor(Arc::clone(&monitor) as Arc<dyn AppMonitor>)
        .proxy(Arc::clone(&remote) as Arc<dyn RemoteAppProxy>)
        .local_bus(Arc::clone(&local_bus) as Arc<dyn LocalBus>)
        .build()
        .await
        .expect("build agent");
    TestHarness {
        agent,
        monitor,
        remote,
        local_bus,
    }
}

/// Announce and claim one application, returning its identity.
pub async fn claim_app(
    harness: &TestHarness,
    bus_name: &str,
    key: PublicKey,
) -> IdentityInfo {
    harness
        .monitor
        .announce(bus_name, key, ClaimState::Claimable);
    harness
        .agent
        .set_manifest_listener(Some(StaticManifestListener::approving()));
    let app = harness.agent.get_application(&key).expect("app in registry");
    let identity = IdentityInfo::new(busguard_core::Guid::random(), "TestIdentity");
    harness.agent.claim(&app, &identity).await.expect("claim");
    // The remote reports itself claimed from now on.
    harness.monitor.announce(bus_name, key, ClaimState::Claimed);
    identity
}
