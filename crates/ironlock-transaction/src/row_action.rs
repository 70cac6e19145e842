//! Pending row mutations

use ironlock_common::{ActionType, Result, RowId, RowPosition, SessionId, TableId, Timestamp};
use ironlock_storage::{PersistentStore, Row};
use std::fmt;
use std::sync::{Arc, Weak};

/// One row mutation recorded in a session's action log.
///
/// The action refers to its row weakly; the store owns the row. Rollback
/// falls back to looking the row up by position when the reference is gone.
pub struct RowAction {
    action_type: ActionType,
    session: SessionId,
    row: Weak<Row>,
    row_id: RowId,
    position: RowPosition,
    table: TableId,
    store: Arc<dyn PersistentStore>,
    /// Action timestamp of the session when the action was recorded
    action_timestamp: Timestamp,
    commit_timestamp: Timestamp,
    rollback_timestamp: Timestamp,
}

impl RowAction {
    fn new(
        action_type: ActionType,
        session: SessionId,
        timestamp: Timestamp,
        store: Arc<dyn PersistentStore>,
        row: &Arc<Row>,
    ) -> Self {
        RowAction {
            action_type,
            session,
            row: Arc::downgrade(row),
            row_id: row.id,
            position: row.position,
            table: row.table,
            store,
            action_timestamp: timestamp,
            commit_timestamp: 0,
            rollback_timestamp: 0,
        }
    }

    /// Record the insert of `row`
    pub fn insert(
        session: SessionId,
        timestamp: Timestamp,
        store: Arc<dyn PersistentStore>,
        row: &Arc<Row>,
    ) -> Self {
        Self::new(ActionType::Insert, session, timestamp, store, row)
    }

    /// Record the delete of `row`; `inserted_here` marks a row inserted by the
    /// same transaction
    pub fn delete(
        session: SessionId,
        timestamp: Timestamp,
        store: Arc<dyn PersistentStore>,
        row: &Arc<Row>,
        inserted_here: bool,
    ) -> Self {
        let action_type = if inserted_here {
            ActionType::InsertThenDelete
        } else {
            ActionType::Delete
        };
        Self::new(action_type, session, timestamp, store, row)
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn position(&self) -> RowPosition {
        self.position
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn action_timestamp(&self) -> Timestamp {
        self.action_timestamp
    }

    /// Commit timestamp, 0 until committed
    pub fn commit_timestamp(&self) -> Timestamp {
        self.commit_timestamp
    }

    /// Timestamp the action was rolled back at, 0 unless rolled back
    pub fn rollback_timestamp(&self) -> Timestamp {
        self.rollback_timestamp
    }

    /// The affected row, if it still exists
    pub fn resolve_row(&self) -> Option<Arc<Row>> {
        self.row
            .upgrade()
            .or_else(|| self.store.get(self.position))
    }

    /// Mark the action committed and return its final state
    pub fn commit(&mut self, timestamp: Timestamp) -> ActionType {
        debug_assert_eq!(self.commit_timestamp, 0, "row action committed twice");
        self.commit_timestamp = timestamp;
        self.action_type = self.action_type.committed();
        self.action_type
    }

    /// Undo the action in its store.
    ///
    /// Returns `false` when there was nothing left to undo.
    pub fn rollback(&mut self, timestamp: Timestamp) -> Result<bool> {
        if !self.action_type.is_pending() {
            return Ok(false);
        }
        let row = match self.resolve_row() {
            Some(row) => row,
            None => {
                self.action_type = ActionType::None;
                return Ok(false);
            }
        };
        self.store.rollback_row(row, self.action_type)?;
        self.rollback_timestamp = timestamp;
        self.action_type = ActionType::None;
        Ok(true)
    }
}

impl fmt::Debug for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowAction")
            .field("type", &self.action_type)
            .field("session", &self.session)
            .field("row", &self.row_id)
            .field("table", &self.table)
            .field("position", &self.position)
            .field("commit_ts", &self.commit_timestamp)
            .field("rollback_ts", &self.rollback_timestamp)
            .finish()
    }
}
