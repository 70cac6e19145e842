//! In-memory row store

use crate::store::{PersistentStore, Row};
use ironlock_common::{ActionType, Error, Result, RowPosition, TableId, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rows of one table kept in memory with an ordered primary index
pub struct MemoryRowStore {
    table: TableId,
    /// Shared generator of row ids across all stores of a database
    row_ids: Arc<AtomicU64>,
    next_position: AtomicU64,
    /// Every allocated row that has not been finally removed
    rows: RwLock<BTreeMap<RowPosition, Arc<Row>>>,
    /// Positions of visible rows
    index: RwLock<BTreeSet<RowPosition>>,
}

impl MemoryRowStore {
    pub fn new(table: TableId, row_ids: Arc<AtomicU64>) -> Self {
        MemoryRowStore {
            table,
            row_ids,
            next_position: AtomicU64::new(1),
            rows: RwLock::new(BTreeMap::new()),
            index: RwLock::new(BTreeSet::new()),
        }
    }

    /// Whether the row at `position` is visible
    pub fn is_indexed(&self, position: RowPosition) -> bool {
        self.index.read().contains(&position)
    }

    /// Number of allocated rows, visible or not
    pub fn allocated_count(&self) -> usize {
        self.rows.read().len()
    }

    fn remove(&self, position: RowPosition) {
        self.index.write().remove(&position);
        self.rows.write().remove(&position);
    }
}

impl PersistentStore for MemoryRowStore {
    fn table_id(&self) -> TableId {
        self.table
    }

    fn new_row(&self, values: Vec<Value>) -> Arc<Row> {
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        let row = Arc::new(Row {
            id: self.row_ids.fetch_add(1, Ordering::SeqCst),
            position,
            table: self.table,
            values,
        });
        self.rows.write().insert(position, row.clone());
        row
    }

    fn get(&self, position: RowPosition) -> Option<Arc<Row>> {
        self.rows.read().get(&position).cloned()
    }

    fn index_row(&self, row: Arc<Row>) -> Result<()> {
        if row.table != self.table {
            return Err(Error::Internal(format!(
                "row {} belongs to table {}, not {}",
                row.id, row.table, self.table
            )));
        }
        let position = row.position;
        self.rows.write().entry(position).or_insert(row);
        self.index.write().insert(position);
        Ok(())
    }

    fn delete(&self, row: &Row) -> Result<()> {
        if !self.index.write().remove(&row.position) {
            return Err(Error::RowNotFound(row.position));
        }
        Ok(())
    }

    fn rollback_row(&self, row: Arc<Row>, action: ActionType) -> Result<()> {
        match action {
            ActionType::Insert => self.remove(row.position),
            ActionType::Delete | ActionType::InsertThenDelete => {
                // The row comes back in the state it had before the delete
                self.index_row(row)?;
            }
            ActionType::None | ActionType::DeleteFinal => {}
        }
        Ok(())
    }

    fn commit_row(&self, row: &Row, action: ActionType) -> Result<()> {
        if action == ActionType::DeleteFinal {
            self.remove(row.position);
        }
        Ok(())
    }

    fn scan(&self) -> Vec<Arc<Row>> {
        let index = self.index.read();
        let rows = self.rows.read();
        index
            .iter()
            .filter_map(|position| rows.get(position).cloned())
            .collect()
    }

    fn row_count(&self) -> usize {
        self.index.read().len()
    }
}
