//! Error types for the shard distribution service.

use std::io;
use thiserror::Error;

/// Result type alias for shard distribution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the shard distribution service.
#[derive(Error, Debug)]
pub enum Error {
    /// Store layer errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Leader election errors.
    #[error("election error: {0}")]
    Election(#[from] ElectionError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The namespace is not served by this distributor.
    #[error("namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// A caller-supplied argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation cannot be served right now; the caller may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An error returned by a remote distributor over the RPC transport.
    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Store layer errors.
///
/// `VersionConflict` and `ShardAlreadyAssigned` are concurrency outcomes:
/// callers retry with fresh state. The rest are precondition violations
/// surfaced to clients as not-found / failed-precondition responses.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The queried executor is not registered in the store.
    #[error("executor not found: {executor_id}")]
    ExecutorNotFound { executor_id: String },

    /// The shard has no recorded owner.
    #[error("shard not found: {shard_key}")]
    ShardNotFound { shard_key: String },

    /// A transactional precondition failed.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// The target executor is not in the ACTIVE state.
    #[error("executor not running: {executor_id}")]
    ExecutorNotRunning { executor_id: String },

    /// The shard is already owned by another executor.
    #[error("shard {shard_key} already assigned to {assigned_to}")]
    ShardAlreadyAssigned {
        shard_key: String,
        assigned_to: String,
    },

    /// Failure in the backing key-value store.
    #[error("backend error: {0}")]
    Backend(#[from] KvError),

    /// A persisted value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key-value backend errors.
#[derive(Error, Debug)]
pub enum KvError {
    /// The lease does not exist or has already expired.
    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    /// The backend has been shut down.
    #[error("backend closed")]
    Closed,

    /// Backend-specific failure.
    #[error("{0}")]
    Internal(String),
}

/// Leader election errors.
#[derive(Error, Debug)]
pub enum ElectionError {
    /// The election session expired before or during the operation.
    #[error("election session expired")]
    SessionExpired,

    /// Campaigning for leadership failed.
    #[error("campaign failed: {0}")]
    CampaignFailed(String),

    /// Failure in the backing key-value store.
    #[error("backend error: {0}")]
    Backend(#[from] KvError),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by the remote side.
    #[error("connection closed")]
    ConnectionClosed,

    /// Wire serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An incoming frame exceeded the size cap.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The peer answered with a frame the caller did not expect.
    #[error("unexpected response frame")]
    UnexpectedResponse,
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::from(e))
    }
}

impl Error {
    /// True if the error is a concurrency conflict worth retrying with
    /// fresh state.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::VersionConflict(_)))
    }
}
