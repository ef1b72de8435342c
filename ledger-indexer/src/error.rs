//! Error types for the ledger indexer

use crate::types::TransactionOpLocator;
use thiserror::Error;

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Indexer errors
#[derive(Error, Debug)]
pub enum Error {
    /// The content of a committed transaction violates an invariant of the derived model
    #[error("Invalid transaction at {locator}: {message}")]
    InvalidTransaction {
        /// Pinpoints the offending transaction / operation
        locator: TransactionOpLocator,
        /// The violated expectation
        message: String,
    },

    /// The accumulator chain does not follow from the committed ledger
    #[error("Inconsistent ledger: {0}")]
    InconsistentLedger(String),

    /// Transactions were passed out of order, with a gap, or on top of the wrong parent
    #[error("Invalid ledger commit: {0}")]
    InvalidLedgerCommit(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON decoding error (ingest input)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The batch was cancelled before it was committed
    #[error("Ledger extension cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::InvalidTransaction`]
    pub fn invalid_transaction(locator: TransactionOpLocator, message: impl Into<String>) -> Self {
        Error::InvalidTransaction {
            locator,
            message: message.into(),
        }
    }

    /// Whether this error means the source ledger or its content cannot be indexed as-is.
    ///
    /// These are deterministic: retrying the same batch reproduces them.
    pub fn is_fatal_ledger_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransaction { .. }
                | Error::InconsistentLedger(_)
                | Error::InvalidLedgerCommit(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transaction_message_carries_locator() {
        let locator = TransactionOpLocator::operation(42, "ab12", 1, 3);
        let err = Error::invalid_transaction(locator, "substate already down");

        let msg = err.to_string();
        assert!(msg.contains("state version 42"));
        assert!(msg.contains("ab12"));
        assert!(msg.contains("substate already down"));
        assert!(err.is_fatal_ledger_error());
    }

    #[test]
    fn test_storage_errors_are_not_ledger_errors() {
        assert!(!Error::Storage("disk full".into()).is_fatal_ledger_error());
        assert!(!Error::Cancelled.is_fatal_ledger_error());
        assert!(Error::InconsistentLedger("fork".into()).is_fatal_ledger_error());
    }
}
