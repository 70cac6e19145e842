//! Error types for IronLock

use crate::types::{RowId, RowPosition, TableId, TransactionControl};
use thiserror::Error;

/// The main error type for IronLock operations
#[derive(Error, Debug)]
pub enum Error {
    // Transaction errors
    #[error("Invalid transaction state: row {row} is owned by another session (OVERWRITE)")]
    OverwriteConflict { row: RowId },

    #[error("Serialization failure")]
    SerializationFailure,

    #[error("Savepoint not found: {0}")]
    SavepointNotFound(String),

    #[error("No transaction is open")]
    NoTransaction,

    #[error("Lock wait timed out")]
    LockWaitTimeout,

    #[error("Unsupported transaction control: {0:?}")]
    UnsupportedTransactionControl(TransactionControl),

    #[error("Cannot change transaction control while other sessions hold or await locks")]
    TransactionControlBusy,

    #[error("Invalid transaction state: active SQL-transaction")]
    TransactionInProgress,

    #[error("Invalid transaction state: read-only SQL-transaction")]
    ReadOnlyTransaction,

    // Session errors
    #[error("Session is closed")]
    SessionClosed,

    // Storage errors
    #[error("Row not found at position {0}")]
    RowNotFound(RowPosition),

    #[error("Table not found: {0}")]
    TableNotFound(TableId),

    #[error("Fatal store error: {0}")]
    FatalStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// SQLSTATE class reported to clients for this error
    pub fn sql_state(&self) -> &'static str {
        match self {
            Error::SerializationFailure | Error::LockWaitTimeout => "40001",
            Error::SavepointNotFound(_) => "3B001",
            Error::OverwriteConflict { .. }
            | Error::NoTransaction
            | Error::TransactionControlBusy => "25000",
            Error::TransactionInProgress => "25001",
            Error::ReadOnlyTransaction => "25006",
            Error::SessionClosed => "08003",
            _ => "HY000",
        }
    }

    /// Whether the caller may retry the whole transaction after a rollback
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SerializationFailure | Error::LockWaitTimeout)
    }
}

/// Result type alias using IronLock's Error
pub type Result<T> = std::result::Result<T, Error>;
