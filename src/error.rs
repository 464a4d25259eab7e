//! Error types for the RDFM device agent

use thiserror::Error;

/// Result type alias for RDFM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the RDFM device agent
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// File store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Action execution error
    #[error("action error: {0}")]
    Action(String),

    /// Malformed or unsupported artifact
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Artifact depends not satisfied by the installed provides
    #[error("{0}")]
    Dependency(String),

    /// Delta encode/decode error
    #[error("delta error: {0}")]
    Delta(String),

    /// Block device error
    #[error("block device error: {0}")]
    BlockDevice(String),

    /// Update stream exceeded the declared image size
    #[error("no space left on device: update exceeds {0} bytes")]
    NoSpace(u64),

    /// Installer lifecycle error
    #[error("install error: {0}")]
    Install(String),

    /// MCUmgr command returned a non-OK status
    #[error("{op} failed (err: NMP err {rc})")]
    Mcumgr {
        /// Operation that failed
        op: &'static str,
        /// MCUmgr return code
        rc: i64,
    },

    /// MCUmgr update flow error
    #[error("mcumgr error: {0}")]
    Update(String),

    /// MCUmgr transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Server rejected the request as unauthorized
    #[error("device is not authorized")]
    Unauthorized,

    /// Management connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// SHA-256 mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum {
        /// Announced digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// Download ended before all bytes arrived and could not be resumed
    #[error("incomplete download: received {received} of {expected} bytes: {reason}")]
    IncompleteDownload {
        /// Bytes received so far
        received: u64,
        /// Expected total length
        expected: u64,
        /// Why resuming gave up
        reason: String,
    },

    /// Operation cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CBOR encoding error
    #[error("cbor error: {0}")]
    Cbor(#[from] serde_cbor::Error),

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors from the durable file store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No free slot for a non-blocking enqueue
    #[error("store is full")]
    Full,

    /// No item for a non-blocking dequeue
    #[error("store is empty")]
    Empty,

    /// Attempted to enqueue a missing blob
    #[error("cannot queue a nil item")]
    NilItem,

    /// Wait interrupted by the cancel token
    #[error("wait cancelled")]
    Cancelled,

    /// Store was reset while waiting
    #[error("store was reset")]
    Reset,
}

impl Error {
    /// Whether this error is a cancellation (from the store or elsewhere)
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Store(StoreError::Cancelled))
    }
}
