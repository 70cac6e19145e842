//! Database configuration

use crate::types::{IsolationLevel, TransactionControl};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a database instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Transaction log file; `None` keeps the log in memory
    pub log_path: Option<PathBuf>,

    /// Autocommit mode of new sessions
    pub default_autocommit: bool,

    /// Isolation level of new sessions
    pub default_isolation: IsolationLevel,

    /// Maximum time a statement waits for table locks; `None` waits forever
    pub lock_wait_timeout: Option<Duration>,

    /// Concurrency control variant
    pub transaction_control: TransactionControl,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            log_path: None,
            default_autocommit: true,
            default_isolation: IsolationLevel::ReadCommitted,
            lock_wait_timeout: None,
            transaction_control: TransactionControl::Locks,
        }
    }
}

impl DatabaseConfig {
    /// Create a config that writes its transaction log to `path`
    pub fn new(log_path: PathBuf) -> Self {
        DatabaseConfig {
            log_path: Some(log_path),
            ..Default::default()
        }
    }

    /// Set the autocommit mode of new sessions
    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.default_autocommit = autocommit;
        self
    }

    /// Set the isolation level of new sessions
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Set the lock wait timeout
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }

    /// Set the concurrency control variant
    pub fn with_transaction_control(mut self, control: TransactionControl) -> Self {
        self.transaction_control = control;
        self
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
