//! Error type shared across the workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by storage, certificate authority, and agent operations.
///
/// `EndOfData` and `NotFound` are expected outcomes of lookups and are never
/// logged as errors by the components that return them.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A read found no matching row, or the queried value is unset or empty.
    #[error("end of data")]
    EndOfData,
    /// An update targeted a row that does not exist.
    #[error("not found")]
    NotFound,
    /// An insert conflicted with an existing row.
    #[error("already exists")]
    AlreadyExists,
    /// Underlying store I/O failure. The enclosing transaction is rolled back.
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    /// The CA signing key is missing or empty.
    #[error("CA key unavailable")]
    KeyUnavailable,
    /// The 32-bit serial counter has been exhausted.
    #[error("serial number space exhausted")]
    SerialExhausted,
    #[error("signature failed: {0}")]
    SignatureFailed(String),
    /// Session join failed or the RPC errored at the transport level.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),
    /// An RPC did not complete within the per-call timeout.
    #[error("remote call timed out")]
    Timeout,
    /// The manifest listener rejected the manifest, or none was installed.
    #[error("manifest rejected: {0}")]
    ManifestRejected(String),
    /// The remote already holds the pushed certificate. Normalized to
    /// success by the reconciler.
    #[error("duplicate certificate")]
    DuplicateCertificate,
    /// The application is not present in the registry.
    #[error("unknown application")]
    UnknownApplication,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}
