//! Error types for the colony coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Invalid action payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Nonce error on chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Transaction {tx_id} already exists")]
    DuplicateTransaction { tx_id: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transaction {tx_id} failed: {message}")]
    TransactionFailed { tx_id: String, message: String },

    #[error("Channel for transaction {tx_id} closed")]
    ChannelClosed { tx_id: String },

    #[error("Group {group_id} ({key}) failed: {source}")]
    GroupFailed {
        group_id: String,
        key: String,
        #[source]
        source: Box<CoordinatorError>,
    },

    #[error("Colony name {name} is already taken")]
    NameTaken { name: String },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ChainConnection { .. }
                | CoordinatorError::Timeout { .. }
                | CoordinatorError::RateLimited { .. }
        )
    }

    /// Short machine-readable kind, used in error payloads and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::Config(_) => "config",
            CoordinatorError::Database(_) => "database",
            CoordinatorError::ChainConnection { .. } => "chain_connection",
            CoordinatorError::Transaction(_) => "transaction",
            CoordinatorError::GasEstimation(_) => "gas_estimation",
            CoordinatorError::EventParsing(_) => "event_parsing",
            CoordinatorError::Coordination(_) => "coordination",
            CoordinatorError::Wallet(_) => "wallet",
            CoordinatorError::Contract(_) => "contract",
            CoordinatorError::InvalidPayload(_) => "invalid_payload",
            CoordinatorError::InvalidRequest(_) => "invalid_request",
            CoordinatorError::Timeout { .. } => "timeout",
            CoordinatorError::TransactionNotFound { .. } => "transaction_not_found",
            CoordinatorError::InvalidStateTransition { .. } => "invalid_state_transition",
            CoordinatorError::TransactionFailed { .. } => "transaction_failed",
            CoordinatorError::ChannelClosed { .. } => "channel_closed",
            CoordinatorError::GroupFailed { .. } => "group_failed",
            CoordinatorError::NameTaken { .. } => "name_taken",
            CoordinatorError::RateLimited { .. } => "rate_limited",
            CoordinatorError::Nonce { .. } => "nonce",
            CoordinatorError::DuplicateTransaction { .. } => "duplicate_transaction",
            CoordinatorError::Internal(_) => "internal",
        }
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoordinatorError::Timeout {
            operation: "send transaction".to_string()
        }
        .is_retryable());
        assert!(!CoordinatorError::Contract("reverted".to_string()).is_retryable());
    }

    #[test]
    fn test_group_failure_keeps_source_message() {
        let err = CoordinatorError::GroupFailed {
            group_id: "g1".to_string(),
            key: "transaction.batch.createColony".to_string(),
            source: Box::new(CoordinatorError::TransactionFailed {
                tx_id: "g1-createColony".to_string(),
                message: "reverted".to_string(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("g1-createColony failed: reverted"));
        assert_eq!(err.kind(), "group_failed");
    }
}
