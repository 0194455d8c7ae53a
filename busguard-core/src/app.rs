//! Applications and their liveness state.

use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;

/// Descriptive metadata attached to a managed application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub app_name: String,
    pub device_name: String,
    pub user_defined_name: String,
}

/// A managed application.
///
/// The public key is the unique identifier; the AKI is derived from it and
/// carried redundantly for certificate subject CN convenience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub public_key: PublicKey,
    pub aki: String,
    /// True while changes to the stored security configuration have not yet
    /// been applied to the remote application itself.
    pub updates_pending: bool,
    pub meta: AppMetadata,
}

impl Application {
    pub fn new(public_key: PublicKey) -> Self {
        let aki = public_key.aki();
        Application {
            public_key,
            aki,
            updates_pending: false,
            meta: AppMetadata::default(),
        }
    }
}

/// Claim lifecycle of a remote application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    NotClaimable,
    Claimable,
    Claimed,
    NeedsUpdate,
}

/// An application together with its ephemeral liveness state.
///
/// An empty `bus_name` means the application is currently offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineApplication {
    pub app: Application,
    pub claim_state: ClaimState,
    pub bus_name: String,
}

impl OnlineApplication {
    /// A claimed application loaded from storage, not yet seen on the bus.
    pub fn offline(app: Application) -> Self {
        OnlineApplication {
            app,
            claim_state: ClaimState::Claimed,
            bus_name: String::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        !self.bus_name.is_empty()
    }
}
