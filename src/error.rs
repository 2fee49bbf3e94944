//! Error types
//! Typed errors for the pieces of the client that can fail outside the state machine.
//! The state machine itself never returns these; it turns them into `Failed` states.

use thiserror::Error;

/// Failure to build an unlock command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("plaintext is {len} bytes, the command block holds 16")]
    BlockOverflow { len: usize },
    #[error("cipher key must be 16 bytes, got {len}")]
    InvalidKeyLength { len: usize },
}

/// Which platform permission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Scan,
    Connect,
}

/// Failure reported synchronously by a platform capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{0:?} permission denied")]
    PermissionDenied(Permission),
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("platform operation failed: {0}")]
    Operation(String),
}

/// Failure to load or save the device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
