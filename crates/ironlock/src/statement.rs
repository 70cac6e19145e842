//! Statements and the context they run in

use crate::Database;
use ironlock_common::{Error, Result, RowPosition, SessionId, TableId, Value};
use ironlock_storage::{PersistentStore, Row};
use ironlock_transaction::{ConcurrencyControl, LockRequest, SessionTxState};
use std::sync::Arc;

/// Result of executing a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    /// Rows inserted or deleted
    pub update_count: usize,
    /// Rows returned by a query
    pub rows: Vec<Vec<Value>>,
}

impl StatementResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn updated(update_count: usize) -> Self {
        StatementResult {
            update_count,
            rows: Vec::new(),
        }
    }

    pub fn rows(rows: Vec<Vec<Value>>) -> Self {
        StatementResult {
            update_count: 0,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A compiled statement as the session sees it
pub trait Statement {
    /// SQL text, for diagnostics
    fn sql(&self) -> &str;

    /// Every table the statement reads or writes
    fn lock_request(&self) -> LockRequest;

    /// Run the statement's row-level work
    fn execute(&self, ctx: &mut StatementContext<'_>) -> Result<StatementResult>;
}

/// Row access for a running statement.
///
/// Every mutation is recorded in the session's action log through the
/// coordinator. Tables outside the statement's lock request are refused.
pub struct StatementContext<'a> {
    db: &'a Database,
    coordinator: &'a dyn ConcurrencyControl,
    state: &'a mut SessionTxState,
    request: &'a LockRequest,
}

impl<'a> StatementContext<'a> {
    pub(crate) fn new(
        db: &'a Database,
        coordinator: &'a dyn ConcurrencyControl,
        state: &'a mut SessionTxState,
        request: &'a LockRequest,
    ) -> Self {
        StatementContext {
            db,
            coordinator,
            state,
            request,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.state.session_id()
    }

    /// Ask for the statement to be undone and run again once it returns
    pub fn request_redo(&self) {
        self.state.signals().request_redo();
    }

    fn store_for_read(&self, table: TableId) -> Result<Arc<dyn PersistentStore>> {
        if !self.request.allows_read(table) {
            return Err(Error::Internal(format!(
                "table {} is not locked by this statement",
                table
            )));
        }
        self.db.table(table)
    }

    fn store_for_write(&self, table: TableId) -> Result<Arc<dyn PersistentStore>> {
        if !self.request.allows_write(table) {
            return Err(Error::Internal(format!(
                "table {} is not locked for write by this statement",
                table
            )));
        }
        self.db.table(table)
    }

    /// Visible rows of `table`
    pub fn scan(&self, table: TableId) -> Result<Vec<Arc<Row>>> {
        Ok(self.store_for_read(table)?.scan())
    }

    /// Insert a row and return its position
    pub fn insert(&mut self, table: TableId, values: Vec<Value>) -> Result<RowPosition> {
        let store = self.store_for_write(table)?;
        let row = store.new_row(values);
        let position = row.position;
        self.coordinator.add_insert_action(self.state, &store, row)?;
        Ok(position)
    }

    /// Delete the row at `position`
    pub fn delete(&mut self, table: TableId, position: RowPosition) -> Result<()> {
        let store = self.store_for_write(table)?;
        let row = store.get(position).ok_or(Error::RowNotFound(position))?;
        self.coordinator.add_delete_action(self.state, &store, &row)
    }

    /// Delete every visible row matching `predicate`; returns the count
    pub fn delete_where<P>(&mut self, table: TableId, predicate: P) -> Result<usize>
    where
        P: Fn(&Row) -> bool,
    {
        let store = self.store_for_write(table)?;
        let rows: Vec<Arc<Row>> = store
            .scan()
            .into_iter()
            .filter(|row| predicate(row))
            .collect();
        self.coordinator.check_delete(self.state, &rows)?;
        for row in &rows {
            self.coordinator.add_delete_action(self.state, &store, row)?;
        }
        Ok(rows.len())
    }

    /// Replace the row at `position` with a new row holding `values`
    pub fn update(
        &mut self,
        table: TableId,
        position: RowPosition,
        values: Vec<Value>,
    ) -> Result<RowPosition> {
        self.delete(table, position)?;
        self.insert(table, values)
    }
}

/// A statement backed by a closure, declaring its tables up front
pub struct DmlStatement<F> {
    sql: String,
    reads: Vec<TableId>,
    writes: Vec<TableId>,
    body: F,
}

impl<F> DmlStatement<F> {
    pub fn new(sql: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut StatementContext<'_>) -> Result<StatementResult>,
    {
        DmlStatement {
            sql: sql.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            body,
        }
    }

    pub fn reads(mut self, tables: &[TableId]) -> Self {
        self.reads.extend_from_slice(tables);
        self
    }

    pub fn writes(mut self, tables: &[TableId]) -> Self {
        self.writes.extend_from_slice(tables);
        self
    }
}

impl<F> Statement for DmlStatement<F>
where
    F: Fn(&mut StatementContext<'_>) -> Result<StatementResult>,
{
    fn sql(&self) -> &str {
        &self.sql
    }

    fn lock_request(&self) -> LockRequest {
        LockRequest::new(self.reads.iter().copied(), self.writes.iter().copied())
    }

    fn execute(&self, ctx: &mut StatementContext<'_>) -> Result<StatementResult> {
        (self.body)(ctx)
    }
}
