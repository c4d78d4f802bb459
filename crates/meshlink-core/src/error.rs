//! Error types for the MeshLink engine

use thiserror::Error;

/// Main error type for MeshLink operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// A transport driver failed to send, connect or discover
    #[error("Transport error: {0}")]
    Transport(String),

    /// Outbound connection to a peer was refused or timed out
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed {
        /// Transport-scoped address of the peer
        address: String,
        /// Driver-supplied reason
        reason: String,
    },

    /// No transport driver is registered for the requested medium
    #[error("No driver registered for transport: {0}")]
    NoDriver(String),

    /// Inbound bytes were not a valid wire message
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cloud synchronization failed
    #[error("Sync error: {0}")]
    Sync(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The node has been disposed and can no longer be used
    #[error("Mesh node has been disposed")]
    Disposed,

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::ConnectFailed {
            address: "wifi:aa:bb".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(format!("{}", err), "Connect to wifi:aa:bb failed: refused");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mesh_err: MeshError = io_err.into();
        assert!(matches!(mesh_err, MeshError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let mesh_err: MeshError = json_err.into();
        assert!(matches!(mesh_err, MeshError::Serialization(_)));
    }
}
