//! Error types for the HTLC solver

use crate::tx::Fee;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain-specific chain rejections, normalized from per-chain error signatures
/// by [`crate::chain::errors`]. The engine only ever matches on this enum.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRejection {
    #[error("HTLC timelock is invalid or expired")]
    InvalidTimelock,

    #[error("hashlock already set")]
    HashlockAlreadySet,

    #[error("HTLC already exists")]
    HtlcAlreadyExists,

    #[error("HTLC already claimed")]
    AlreadyClaimed,

    #[error("transaction underpriced")]
    Underpriced,

    #[error("nonce too low")]
    NonceTooLow,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("{0}")]
    Other(String),
}

/// Main error type for the solver
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for network {network}: {message}")]
    ChainConnection { network: String, message: String },

    #[error("All {} nodes failed for network {network}", .failures.len())]
    AllNodesFailed {
        network: String,
        failures: Vec<(String, String)>,
    },

    #[error("Network {network} rejected the transaction: {rejection}")]
    Rejected {
        network: String,
        rejection: ChainRejection,
    },

    #[error("Transaction not yet confirmed on {network} (ids: {ids:?})")]
    NotConfirmed { network: String, ids: Vec<String> },

    #[error("Transaction {tx_id} failed on network {network}")]
    TransactionFailed { network: String, tx_id: String },

    #[error("Fee still underpriced after {attempts} attempts on network {network}")]
    UnderpricedExhausted { network: String, attempts: u32 },

    #[error("Nonce error for network {network}: {message}")]
    Nonce { network: String, message: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Network {network} not found")]
    NetworkNotFound { network: String },

    #[error("Execution {build_id} is already in flight on instance {owner}")]
    AlreadyInFlight { build_id: String, owner: String },

    #[error("{operation} on {network} (swap {swap_id:?}) failed: {source}")]
    Execution {
        network: String,
        operation: String,
        swap_id: Option<String>,
        last_fee: Option<Fee>,
        published_ids: Vec<String>,
        #[source]
        source: Box<SolverError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SolverError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SolverError::ChainConnection { .. }
            | SolverError::AllNodesFailed { .. }
            | SolverError::Timeout { .. }
            | SolverError::NotConfirmed { .. }
            | SolverError::Database(_) => true,
            SolverError::Rejected { rejection, .. } => matches!(
                rejection,
                ChainRejection::HtlcAlreadyExists | ChainRejection::Other(_)
            ),
            SolverError::Execution { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        match self {
            SolverError::Rejected { rejection, .. } => {
                matches!(rejection, ChainRejection::InsufficientFunds)
            }
            SolverError::UnderpricedExhausted { .. } | SolverError::Wallet(_) => true,
            SolverError::Execution { source, .. } => source.should_alert(),
            _ => false,
        }
    }

    /// The typed chain rejection behind this error, if any
    pub fn rejection(&self) -> Option<&ChainRejection> {
        match self.root_cause() {
            SolverError::Rejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }

    /// Innermost error, unwrapping execution context layers
    pub fn root_cause(&self) -> &SolverError {
        match self {
            SolverError::Execution { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type for solver operations
pub type SolverResult<T> = Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(rejection: ChainRejection) -> SolverError {
        SolverError::Rejected {
            network: "ethereum".to_string(),
            rejection,
        }
    }

    #[test]
    fn test_domain_rejections_are_not_blindly_retried() {
        assert!(!rejected(ChainRejection::InvalidTimelock).is_retryable());
        assert!(!rejected(ChainRejection::HashlockAlreadySet).is_retryable());
        assert!(!rejected(ChainRejection::Underpriced).is_retryable());
        assert!(rejected(ChainRejection::HtlcAlreadyExists).is_retryable());
        assert!(rejected(ChainRejection::Other("execution reverted".into())).is_retryable());
    }

    #[test]
    fn test_execution_wrapper_delegates_to_source() {
        let err = SolverError::Execution {
            network: "ethereum".to_string(),
            operation: "htlc_lock".to_string(),
            swap_id: Some("0xabc".to_string()),
            last_fee: None,
            published_ids: vec!["0x01".to_string()],
            source: Box::new(rejected(ChainRejection::InvalidTimelock)),
        };

        assert!(!err.is_retryable());
        assert_eq!(err.rejection(), Some(&ChainRejection::InvalidTimelock));
        assert!(err.to_string().contains("htlc_lock on ethereum"));
    }

    #[test]
    fn test_config_errors_are_permanent() {
        assert!(!SolverError::Config("no token mapping".into()).is_retryable());
        assert!(SolverError::Timeout {
            operation: "get_receipt".into()
        }
        .is_retryable());
    }
}
