//! Error types for the bridge relayer

use ethers::types::H256;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    Connection { chain_id: u64, message: String },

    #[error("Transaction rejected by chain {chain_id}: {message}")]
    Submission { chain_id: u64, message: String },

    #[error("Broadcast of {tx_hash:?} on chain {chain_id} has unknown outcome: {message}")]
    BroadcastUnknown {
        chain_id: u64,
        tx_hash: H256,
        message: String,
    },

    #[error("Transaction {tx_hash:?} reverted: {reason}")]
    Revert { tx_hash: H256, reason: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid state transition for {key} from {from} to {to}")]
    InvalidStateTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Record {key} is already claimed")]
    AlreadyClaimed { key: String },

    #[error("Record {key} not found")]
    RecordNotFound { key: String },
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Connection { .. }
                | RelayerError::Submission { .. }
                | RelayerError::BroadcastUnknown { .. }
                | RelayerError::Revert { .. }
                | RelayerError::Timeout { .. }
        )
    }

    /// Errors that must stop the process when seen before the pipeline starts
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            RelayerError::Config(_)
                | RelayerError::Wallet(_)
                | RelayerError::Connection { .. }
                | RelayerError::Ledger(_)
                | RelayerError::Database(_)
                | RelayerError::Serialization(_)
                | RelayerError::Io(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
