//! The busguard security management agent.
//!
//! Issues identity and membership certificates for applications on a device
//! bus, persists the authoritative security state, and reconciles online
//! remotes with that state.
//!
//! # Architecture
//!
//! - `monitor` / `proxy` — capability traits for the announcement layer and
//!   the per-application bus operations
//! - `registry` — in-memory index of known applications
//! - `events` — listener dispatch worker and sync-error reporting
//! - `updater` — the reconciliation queue and worker
//! - `claim` — the claim protocol driver and manifest approval
//! - `agent` — the facade, builder, and self-claiming bootstrap
//! - `config` — agent configuration

pub mod agent;
pub mod claim;
pub mod config;
pub mod events;
pub mod monitor;
pub mod proxy;
pub mod registry;
pub mod updater;

pub use agent::{LocalBus, SecurityAgent, SecurityAgentBuilder};
pub use claim::ManifestListener;
pub use config::AgentConfig;
pub use events::{ApplicationListener, ListenerHub, SyncError, SyncErrorKind};
pub use monitor::{AppMonitor, SecurityStateListener, StateAnnouncement};
pub use proxy::{RemoteAppProxy, RPC_TIMEOUT};
pub use registry::AppRegistry;
pub use updater::{Reconciler, SecurityEvent};
