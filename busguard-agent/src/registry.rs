//! In-memory index of known applications.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use busguard_core::{Application, ClaimState, OnlineApplication, PublicKey};

use crate::events::ListenerHub;
use crate::monitor::StateAnnouncement;

/// The in-memory view of every application this agent knows about, keyed by
/// public key. Merges observed liveness with persisted facts; all changes
/// are reported through the listener hub as before/after pairs.
pub struct AppRegistry {
    apps: Mutex<HashMap<PublicKey, OnlineApplication>>,
    own_bus_name: Mutex<String>,
    hub: Arc<ListenerHub>,
}

impl AppRegistry {
    pub fn new(hub: Arc<ListenerHub>) -> Self {
        AppRegistry {
            apps: Mutex::new(HashMap::new()),
            own_bus_name: Mutex::new(String::new()),
            hub,
        }
    }

    /// The agent's own unique bus name; self-announcements are dropped.
    pub fn set_own_bus_name(&self, bus_name: &str) {
        *self.own_bus_name.lock() = bus_name.to_string();
    }

    /// Insert a persisted application as offline, without notifying. Used
    /// while loading managed applications at startup.
    pub fn seed(&self, app: Application) {
        let online = OnlineApplication::offline(app);
        self.apps.lock().insert(online.app.public_key, online);
    }

    /// Merge an announcement into the index. Returns false when the
    /// announcement is the agent's own and was dropped.
    pub fn observe_announcement(&self, announcement: &StateAnnouncement) -> bool {
        if *self.own_bus_name.lock() == announcement.bus_name {
            return false;
        }
        let (old, new) = {
            let mut apps = self.apps.lock();
            match apps.get_mut(&announcement.public_key) {
                Some(entry) => {
                    let old = entry.clone();
                    entry.bus_name = announcement.bus_name.clone();
                    entry.claim_state = announcement.state;
                    (Some(old), entry.clone())
                }
                None => {
                    let entry = OnlineApplication {
                        app: Application::new(announcement.public_key),
                        claim_state: announcement.state,
                        bus_name: announcement.bus_name.clone(),
                    };
                    apps.insert(announcement.public_key, entry.clone());
                    (None, entry)
                }
            }
        };
        self.hub.notify_state_change(old, Some(new));
        true
    }

    /// Mark the application with this bus name as offline.
    pub fn observe_lost(&self, bus_name: &str) {
        let change = {
            let mut apps = self.apps.lock();
            apps.values_mut()
                .find(|entry| entry.bus_name == bus_name)
                .map(|entry| {
                    let old = entry.clone();
                    entry.bus_name.clear();
                    (old, entry.clone())
                })
        };
        if let Some((old, new)) = change {
            self.hub.notify_state_change(Some(old), Some(new));
        }
    }

    /// Update the pending flag, notifying only on an actual transition.
    pub fn set_updates_pending(&self, key: &PublicKey, pending: bool) {
        let change = {
            let mut apps = self.apps.lock();
            apps.get_mut(key).and_then(|entry| {
                if entry.app.updates_pending == pending {
                    return None;
                }
                let old = entry.clone();
                entry.app.updates_pending = pending;
                Some((old, entry.clone()))
            })
        };
        if let Some((old, new)) = change {
            self.hub.notify_state_change(Some(old), Some(new));
        }
    }

    pub fn set_claim_state(&self, key: &PublicKey, state: ClaimState) {
        let change = {
            let mut apps = self.apps.lock();
            apps.get_mut(key).and_then(|entry| {
                if entry.claim_state == state {
                    return None;
                }
                let old = entry.clone();
                entry.claim_state = state;
                Some((old, entry.clone()))
            })
        };
        if let Some((old, new)) = change {
            self.hub.notify_state_change(Some(old), Some(new));
        }
    }

    pub fn get(&self, key: &PublicKey) -> Option<OnlineApplication> {
        self.apps.lock().get(key).cloned()
    }

    /// All known applications, optionally filtered by claim state.
    pub fn list(&self, filter: Option<ClaimState>) -> Vec<OnlineApplication> {
        self.apps
            .lock()
            .values()
            .filter(|entry| filter.is_none_or(|state| entry.claim_state == state))
            .cloned()
            .collect()
    }
}
