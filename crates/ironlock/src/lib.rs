//! IronLock - an embedded row store with table-level two-phase locking
//!
//! IronLock runs concurrent sessions, one per thread, over shared row stores:
//! - Table locks acquired per statement, all or nothing
//! - Waiting sessions parked on their own latch, served first come first served
//! - Statement, savepoint and transaction rollback
//! - A write-ahead transaction log written at commit
//!
//! # Example
//!
//! ```rust
//! use ironlock::storage::PersistentStore;
//! use ironlock::{Database, DmlStatement, StatementResult, Value};
//!
//! let db = Database::new();
//! let accounts = db.create_table("accounts");
//!
//! let mut session = db.connect();
//! session.set_autocommit(false).unwrap();
//!
//! let insert = DmlStatement::new("INSERT INTO accounts VALUES (1)", move |ctx| {
//!     ctx.insert(accounts, vec![Value::Integer(1)])?;
//!     Ok(StatementResult::updated(1))
//! })
//! .writes(&[accounts]);
//!
//! session.execute(&insert).unwrap();
//! session.commit().unwrap();
//! assert_eq!(db.table(accounts).unwrap().row_count(), 1);
//! ```

pub use ironlock_common as common;
pub use ironlock_storage as storage;
pub use ironlock_transaction as transaction;

mod session;
mod statement;

pub use ironlock_common::{
    DatabaseConfig, Error, IsolationLevel, Result, TableId, TransactionControl, Value,
};
pub use session::Session;
pub use statement::{DmlStatement, Statement, StatementContext, StatementResult};

use ironlock_common::Timestamp;
use ironlock_storage::{FileLogger, Logger, MemoryLogger, PersistentStore, TableStorage};
use ironlock_transaction::{
    build_coordinator, ClockHandoff, ConcurrencyControl, TwoPhaseLocking,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::info;

struct DatabaseShared {
    config: DatabaseConfig,
    tables: TableStorage,
    logger: Arc<dyn Logger>,
    coordinator: Arc<dyn ConcurrencyControl>,
}

/// The main database instance.
///
/// Cheap to clone; clones share the tables, the log and the one transaction
/// coordinator every session of the database goes through.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// Create a new in-memory database
    pub fn new() -> Self {
        let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
        let coordinator = Arc::new(TwoPhaseLocking::new(logger.clone()));
        Database {
            shared: Arc::new(DatabaseShared {
                config: DatabaseConfig::default(),
                tables: TableStorage::new(),
                logger,
                coordinator,
            }),
        }
    }

    /// Open a database with its transaction log at `config.log_path`, or in
    /// memory when no path is set
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let logger: Arc<dyn Logger> = match &config.log_path {
            Some(path) => Arc::new(FileLogger::open(path)?),
            None => Arc::new(MemoryLogger::new()),
        };
        Self::with_logger(config, logger)
    }

    /// Open a database writing its transaction log to `logger`
    pub fn with_logger(config: DatabaseConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        let coordinator = build_coordinator(
            config.transaction_control,
            ClockHandoff::default(),
            logger.clone(),
        )?;
        info!(
            transaction_control = ?config.transaction_control,
            log = ?config.log_path,
            "database opened"
        );
        Ok(Database {
            shared: Arc::new(DatabaseShared {
                config,
                tables: TableStorage::new(),
                logger,
                coordinator,
            }),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    /// Create a table, or return the id of the existing table with this name
    pub fn create_table(&self, name: &str) -> TableId {
        self.shared.tables.get_or_create(name)
    }

    /// Create a table backed by a store built by `build`.
    ///
    /// `build` receives the table id and the database's shared row id counter.
    pub fn create_table_with<F>(&self, name: &str, build: F) -> TableId
    where
        F: FnOnce(TableId, Arc<AtomicU64>) -> Arc<dyn PersistentStore>,
    {
        self.shared.tables.get_or_register(name, build)
    }

    /// Get the store of a table
    pub fn table(&self, table: TableId) -> Result<Arc<dyn PersistentStore>> {
        self.shared.tables.get(table)
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.shared.tables.table_id(name)
    }

    /// Open a new session
    pub fn connect(&self) -> Session {
        Session::new(self.clone())
    }

    /// Flush the transaction log and write a checkpoint record
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.logger.checkpoint()?;
        info!("checkpoint");
        Ok(())
    }

    /// Get the transaction coordinator
    pub fn coordinator(&self) -> &Arc<dyn ConcurrencyControl> {
        &self.shared.coordinator
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.shared.logger
    }

    pub fn transaction_control(&self) -> TransactionControl {
        self.shared.coordinator.transaction_control()
    }

    /// Current value of the logical clock
    pub fn global_change_timestamp(&self) -> Timestamp {
        self.shared.coordinator.global_change_timestamp()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
