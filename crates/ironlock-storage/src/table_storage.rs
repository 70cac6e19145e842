//! Registry of the row stores of a database

use crate::memory_store::MemoryRowStore;
use crate::store::PersistentStore;
use hashbrown::HashMap;
use ironlock_common::{Error, Result, TableId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Storage for all tables of a database
pub struct TableStorage {
    /// Table id -> store
    stores: RwLock<HashMap<TableId, Arc<dyn PersistentStore>>>,
    /// Normalized table name -> table id
    names: RwLock<HashMap<String, TableId>>,
    next_table_id: AtomicU64,
    row_ids: Arc<AtomicU64>,
}

impl TableStorage {
    pub fn new() -> Self {
        TableStorage {
            stores: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            next_table_id: AtomicU64::new(1),
            row_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a normalized key for case-insensitive lookups
    fn make_key(name: &str) -> String {
        name.to_lowercase()
    }

    /// Get or create the in-memory store of a table
    pub fn get_or_create(&self, name: &str) -> TableId {
        self.get_or_register(name, |id, row_ids| Arc::new(MemoryRowStore::new(id, row_ids)))
    }

    /// Get the table named `name`, creating its store with `build` if it
    /// does not exist yet.
    ///
    /// `build` receives the new table id and the row id counter shared by
    /// every table of the database.
    pub fn get_or_register<F>(&self, name: &str, build: F) -> TableId
    where
        F: FnOnce(TableId, Arc<AtomicU64>) -> Arc<dyn PersistentStore>,
    {
        let key = Self::make_key(name);

        if let Some(id) = self.names.read().get(&key) {
            return *id;
        }

        let mut names = self.names.write();
        if let Some(id) = names.get(&key) {
            return *id;
        }
        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let store = build(id, self.row_ids.clone());
        debug_assert_eq!(store.table_id(), id);
        self.stores.write().insert(id, store);
        names.insert(key, id);
        id
    }

    /// Get a store by table id
    pub fn get(&self, table: TableId) -> Result<Arc<dyn PersistentStore>> {
        self.stores
            .read()
            .get(&table)
            .cloned()
            .ok_or(Error::TableNotFound(table))
    }

    /// Look up a table id by name
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.names.read().get(&Self::make_key(name)).copied()
    }

    /// Number of tables
    pub fn table_count(&self) -> usize {
        self.stores.read().len()
    }
}

impl Default for TableStorage {
    fn default() -> Self {
        Self::new()
    }
}
