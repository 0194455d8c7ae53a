//! The announcement and discovery capability.

use std::sync::Arc;

use busguard_core::{ClaimState, PublicKey, Result};

/// A security state announcement observed on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAnnouncement {
    pub bus_name: String,
    pub public_key: PublicKey,
    pub state: ClaimState,
}

/// Receives announcement deltas from an [`AppMonitor`].
pub trait SecurityStateListener: Send + Sync {
    /// `old = None` means the application was newly observed; `new = None`
    /// means it disappeared from the bus.
    fn on_state_change(&self, old: Option<&StateAnnouncement>, new: Option<&StateAnnouncement>);
}

/// The announcement layer. Implementations own the monitor thread and call
/// registered listeners from it; listeners must not block.
pub trait AppMonitor: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn SecurityStateListener>);

    fn unregister_listener(&self, listener: &Arc<dyn SecurityStateListener>);

    /// The current announcement for a bus name, if the application is live.
    /// `EndOfData` when the bus name is unknown or the peer stopped
    /// responding to liveness pings.
    fn application(&self, bus_name: &str) -> Result<StateAnnouncement>;
}
