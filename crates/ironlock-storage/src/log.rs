//! Transaction log interface and the in-memory logger

use crate::store::Row;
use ironlock_common::{ActionType, Result, RowPosition, SessionId, TableId, Timestamp, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One entry of the transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A session-level SQL statement such as SAVEPOINT or ROLLBACK
    Statement { session: SessionId, sql: String },
    /// A committed row insert
    Insert {
        session: SessionId,
        table: TableId,
        position: RowPosition,
        values: Vec<Value>,
    },
    /// A committed row delete
    Delete {
        session: SessionId,
        table: TableId,
        position: RowPosition,
    },
    /// End of a committed transaction
    Commit {
        session: SessionId,
        timestamp: Timestamp,
    },
    Checkpoint,
}

impl LogRecord {
    /// Build the record for a committed row action, if the action leaves a trace
    pub fn for_action(session: SessionId, action: ActionType, row: &Row) -> Option<LogRecord> {
        match action {
            ActionType::Insert => Some(LogRecord::Insert {
                session,
                table: row.table,
                position: row.position,
                values: row.values.clone(),
            }),
            ActionType::Delete => Some(LogRecord::Delete {
                session,
                table: row.table,
                position: row.position,
            }),
            // Inserted and deleted by the same transaction: nothing to replay
            _ => None,
        }
    }
}

/// Append-only durability collaborator.
///
/// A commit is durable once `write_commit` returns `Ok`.
pub trait Logger: Send + Sync {
    /// Append a session-level statement
    fn write_to_log(&self, session: SessionId, sql: &str) -> Result<()>;

    /// Append the effect of one committed row action
    fn write_row_action(&self, session: SessionId, action: ActionType, row: &Row) -> Result<()>;

    /// Append the commit record and make everything before it durable
    fn write_commit(&self, session: SessionId, timestamp: Timestamp) -> Result<()>;

    /// Flush the log and mark a checkpoint
    fn checkpoint(&self) -> Result<()>;
}

/// Logger that keeps its records in memory
#[derive(Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records written so far
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    fn append(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}

impl Logger for MemoryLogger {
    fn write_to_log(&self, session: SessionId, sql: &str) -> Result<()> {
        self.append(LogRecord::Statement {
            session,
            sql: sql.to_string(),
        });
        Ok(())
    }

    fn write_row_action(&self, session: SessionId, action: ActionType, row: &Row) -> Result<()> {
        if let Some(record) = LogRecord::for_action(session, action, row) {
            self.append(record);
        }
        Ok(())
    }

    fn write_commit(&self, session: SessionId, timestamp: Timestamp) -> Result<()> {
        self.append(LogRecord::Commit { session, timestamp });
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.append(LogRecord::Checkpoint);
        Ok(())
    }
}
