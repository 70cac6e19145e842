//! IronLock Common - Core types and utilities shared across all crates
//!
//! This crate provides the foundational types used throughout IronLock:
//! - Identifiers for sessions, tables, rows and logical timestamps
//! - `ActionType`: the state of a pending row mutation
//! - `Value`: Runtime value representation
//! - `Error`: Unified error types
//! - `DatabaseConfig`: Engine configuration

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::DatabaseConfig;
pub use error::{Error, Result};
pub use types::{
    ActionType, IsolationLevel, RowId, RowPosition, SessionId, TableId, Timestamp,
    TransactionControl,
};
pub use value::Value;
