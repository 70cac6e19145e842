//! Identifiers and small enums shared by the transaction core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session identifier, unique per database
pub type SessionId = u64;

/// Lockable unit identifier (a table)
pub type TableId = u64;

/// Row identity, stable for the lifetime of a row
pub type RowId = u64;

/// Position of a row inside its store
pub type RowPosition = u64;

/// Logical clock value
pub type Timestamp = u64;

/// State of a pending row mutation.
///
/// `Insert`, `Delete` and `InsertThenDelete` are live states of an open
/// transaction. `None` marks an action with nothing left to undo (a committed
/// insert or any rolled back action) and `DeleteFinal` a committed delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Insert,
    Delete,
    InsertThenDelete,
    None,
    DeleteFinal,
}

impl ActionType {
    /// Whether rollback still has work to do for this action
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ActionType::Insert | ActionType::Delete | ActionType::InsertThenDelete
        )
    }

    /// The state an action moves to when its transaction commits
    pub fn committed(&self) -> ActionType {
        match self {
            ActionType::Insert => ActionType::None,
            ActionType::Delete | ActionType::InsertThenDelete => ActionType::DeleteFinal,
            other => *other,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::Insert => "INSERT",
            ActionType::Delete => "DELETE",
            ActionType::InsertThenDelete => "INSERT_DELETE",
            ActionType::None => "NONE",
            ActionType::DeleteFinal => "DELETE_FINAL",
        };
        write!(f, "{}", name)
    }
}

/// Transaction isolation level of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read locks are released at the end of each statement
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Whether table read locks are kept until the transaction ends
    pub fn holds_read_locks(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// Concurrency control variant of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionControl {
    /// Table-level two-phase locking
    #[default]
    Locks,
    /// Multi-version rows without locks
    Mvcc,
    /// Multi-version rows with table write locks
    MvLocks,
}
