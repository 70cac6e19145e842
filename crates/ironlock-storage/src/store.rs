//! The row store interface used by the transaction core

use ironlock_common::{ActionType, Result, RowId, RowPosition, TableId, Value};
use std::sync::Arc;

/// A row held by a store
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Identity of the row across all tables
    pub id: RowId,
    /// Position inside the owning store
    pub position: RowPosition,
    /// Owning table
    pub table: TableId,
    /// Column values
    pub values: Vec<Value>,
}

/// Storage of the rows and index of a single table.
///
/// Rows are allocated with `new_row` and become visible once indexed. A
/// deleted row stays retrievable through `get` until its delete is either
/// rolled back or made final, so that undo can always find it.
pub trait PersistentStore: Send + Sync {
    /// The table this store belongs to
    fn table_id(&self) -> TableId;

    /// Allocate a row without making it visible
    fn new_row(&self, values: Vec<Value>) -> Arc<Row>;

    /// Look up a row by position, visible or not
    fn get(&self, position: RowPosition) -> Option<Arc<Row>>;

    /// Add a row to the index
    fn index_row(&self, row: Arc<Row>) -> Result<()>;

    /// Remove a row from the index
    fn delete(&self, row: &Row) -> Result<()>;

    /// Undo the effect of an action of the given type on a row
    fn rollback_row(&self, row: Arc<Row>, action: ActionType) -> Result<()>;

    /// Make the effect of a committed action permanent.
    ///
    /// Called after the commit record is written. An error here does not
    /// undo the commit; the coordinator finishes the commit and reports it
    /// as `FatalStore`.
    fn commit_row(&self, row: &Row, action: ActionType) -> Result<()>;

    /// All visible rows in position order
    fn scan(&self) -> Vec<Arc<Row>>;

    /// Number of visible rows
    fn row_count(&self) -> usize;
}
