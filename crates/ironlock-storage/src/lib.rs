//! IronLock Storage - Row stores and the transaction log
//!
//! The transaction core only talks to storage through two traits:
//! - `PersistentStore`: holds the rows and the index of one table
//! - `Logger`: appends the durable record of statements and commits
//!
//! This crate defines both and ships the implementations the engine uses.

pub mod log;
pub mod memory_store;
pub mod persistence;
pub mod store;
pub mod table_storage;

pub use log::{LogRecord, Logger, MemoryLogger};
pub use memory_store::MemoryRowStore;
pub use persistence::FileLogger;
pub use store::{PersistentStore, Row};
pub use table_storage::TableStorage;
