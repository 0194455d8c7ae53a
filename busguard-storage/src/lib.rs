//! Durable storage and certificate authority for the busguard security agent.
//!
//! # Architecture
//!
//! - `sql` — rusqlite-backed typed schema, scoped transactions, serial counter
//! - `ca` — CA key custody, certificate minting and signing
//! - `store` — the persisted-store facade: listeners, authority
//!   canonicalization, updates-pending bookkeeping

pub mod ca;
pub mod sql;
pub mod store;

pub use ca::{AgentRegistration, CertificateAuthority, ADMIN_GROUP_GUID_BYTE, ADMIN_GROUP_NAME};
pub use sql::{SqlStorage, StorageTx};
pub use store::{AgentStorage, StorageListener};
