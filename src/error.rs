//! Error types for QRLedger

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Replayed nonce {nonce} for sender {sender} (last confirmed: {confirmed})")]
    ReplayedNonce {
        sender: String,
        nonce: u64,
        confirmed: u64,
    },
    #[error("Decryption failed")]
    DecryptionError,
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Unauthorized action: {0}")]
    UnauthorizedAction(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Consensus rejected block: {0}")]
    ConsensusRejected(String),
    #[error("Invalid block linkage")]
    InvalidBlockLinkage,
    #[error("Chain integrity violated: {0}")]
    ChainCorrupted(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Unknown contract: {0}")]
    UnknownContract(String),
    #[error("Contract already exists: {0}")]
    ContractAlreadyExists(String),
    #[error("Contract execution failed: {0}")]
    ContractExecution(String),
    #[error("Insufficient stake for {address}: has {available}, requested {requested}")]
    InsufficientStake {
        address: String,
        available: u64,
        requested: u64,
    },
    #[error("No forger could be selected")]
    NoForger,
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
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
