//! ShardMaster Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ShardMaster operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardMaster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Frame checksum mismatch from {0}")]
    ChecksumMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Node errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Not available for dispatch: {0}")]
    NodeUnavailable(String),

    #[error("No replica reachable for key {key} ({attempted} attempted)")]
    NoReplicaReachable { key: String, attempted: usize },

    #[error("Unexpected response from {node}: {detail}")]
    UnexpectedResponse { node: String, detail: String },

    // Logical errors
    #[error("{0}")]
    Rejected(String),

    // Lock errors
    #[error("no transaction mode")]
    TransactionDisabled,

    #[error("Key is locked by another transaction")]
    LockHeld,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Client-facing error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Rejected before any node was contacted
    Validation,
    /// No node could be reached
    Network,
    /// A reachable node refused the operation
    Logical,
    /// The operation is disabled by configuration
    NotPermitted,
    /// Anything unexpected
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "VALIDATION"),
            ErrorKind::Network => write!(f, "NETWORK"),
            ErrorKind::Logical => write!(f, "LOGICAL"),
            ErrorKind::NotPermitted => write!(f, "NOT_PERMITTED"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl Error {
    /// Check if this error came from talking to a node over the network
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ChecksumMismatch(_)
                | Error::Io(_)
                | Error::Serialization(_)
                | Error::NodeUnavailable(_)
        )
    }

    /// Check if another replica may be tried after this error
    pub fn is_retryable(&self) -> bool {
        self.is_network()
    }

    /// Map the error onto the client-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Rejected(_) | Error::LockHeld => ErrorKind::Logical,
            Error::TransactionDisabled => ErrorKind::NotPermitted,
            Error::NoReplicaReachable { .. } => ErrorKind::Network,
            e if e.is_network() => ErrorKind::Network,
            _ => ErrorKind::Internal,
        }
    }
}
