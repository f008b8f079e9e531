//! Error types for RelayChain

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// The persisted chain is broken and autofix is disabled. The node must stop.
    #[error("Saved chain corrupted in block {index}")]
    ChainCorrupted { index: u64 },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Block {0} not found")]
    BlockNotFound(u64),
    #[error("Message rejected: {0}")]
    RejectedMessage(String),
    #[error("No delegate answered the block request in time")]
    DelegationTimeout,
    #[error("Block handler failed: {0}")]
    HandlerFailed(String),
    #[error("Chain is busy (sync or chain response in progress)")]
    ChainBusy,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Contract error: {0}")]
    ContractError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl ChainError {
    /// Fatal errors halt the node; everything else degrades to logging and retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::ChainCorrupted { .. })
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
