//! Sessions: statement execution and transaction control

use crate::statement::{Statement, StatementContext, StatementResult};
use crate::Database;
use ironlock_common::{Error, IsolationLevel, Result, SessionId, TransactionControl};
use ironlock_transaction::{
    build_coordinator, BeginAction, ConcurrencyControl, LockRequest, SessionTxState, WaitOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A connection to a database, used by one thread at a time.
///
/// Dropping a session rolls back its open transaction.
pub struct Session {
    db: Database,
    coordinator: Arc<dyn ConcurrencyControl>,
    state: SessionTxState,
    autocommit: bool,
    lock_wait_timeout: Option<Duration>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(db: Database) -> Self {
        let coordinator = db.coordinator().clone();
        let config = db.config();
        let state = coordinator.register_session(config.default_isolation);
        let autocommit = config.default_autocommit;
        let lock_wait_timeout = config.lock_wait_timeout;
        Session {
            db,
            coordinator,
            state,
            autocommit,
            lock_wait_timeout,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.session_id()
    }

    /// Transactional state, for inspection
    pub fn state(&self) -> &SessionTxState {
        &self.state
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state.is_transaction()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.state.isolation()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Roll back after an abort request and report the serialization failure
    fn abort(&mut self) -> Error {
        debug!(session = self.id(), "transaction aborted");
        self.coordinator.rollback(&mut self.state);
        Error::SerializationFailure
    }

    fn abort_requested(&self) -> bool {
        self.state.signals().is_abort_requested()
    }

    fn log_statement(&self, sql: &str) {
        if let Err(e) = self.db.logger().write_to_log(self.id(), sql) {
            warn!(session = self.id(), sql, error = %e, "failed to log statement");
        }
    }

    /// Wait until every lock of `request` is held
    fn acquire_locks(&mut self, request: &LockRequest) -> Result<()> {
        loop {
            match self.coordinator.begin_action(&mut self.state, request) {
                Ok(BeginAction::Proceed) => return Ok(()),
                Ok(BeginAction::MustWait) => {}
                Err(Error::SerializationFailure) => return Err(self.abort()),
                Err(e) => return Err(e),
            }
            match self.state.signals().wait_for_locks(self.lock_wait_timeout) {
                WaitOutcome::Released => continue,
                WaitOutcome::Cancelled => return Err(self.abort()),
                WaitOutcome::TimedOut => {
                    debug!(session = self.id(), "lock wait timed out");
                    self.coordinator.cancel_wait(&mut self.state);
                    self.coordinator.rollback(&mut self.state);
                    return Err(Error::LockWaitTimeout);
                }
            }
        }
    }

    /// Execute a statement under the table locks it declares.
    ///
    /// In autocommit mode the transaction is committed after the statement,
    /// or rolled back if the statement fails.
    pub fn execute(&mut self, statement: &dyn Statement) -> Result<StatementResult> {
        self.ensure_open()?;
        let request = statement.lock_request();
        if self.state.is_read_only() && !request.writes().is_empty() {
            return Err(Error::ReadOnlyTransaction);
        }
        loop {
            if self.abort_requested() {
                return Err(self.abort());
            }
            self.acquire_locks(&request)?;
            if self.abort_requested() {
                return Err(self.abort());
            }
            if let Err(e) = self.coordinator.begin_action_resume(&mut self.state) {
                self.coordinator.rollback(&mut self.state);
                return Err(e);
            }

            let result = {
                let mut ctx = StatementContext::new(
                    &self.db,
                    self.coordinator.as_ref(),
                    &mut self.state,
                    &request,
                );
                statement.execute(&mut ctx)
            };

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    debug!(session = self.id(), sql = statement.sql(), error = %e, "statement failed");
                    self.coordinator.rollback_action(&mut self.state);
                    if self.abort_requested() {
                        return Err(self.abort());
                    }
                    if self.autocommit {
                        self.coordinator.rollback(&mut self.state);
                    }
                    return Err(e);
                }
            };

            if self.state.signals().take_redo() {
                debug!(session = self.id(), sql = statement.sql(), "redo statement");
                self.coordinator.rollback_action(&mut self.state);
                continue;
            }
            self.coordinator.complete_actions(&mut self.state);
            if self.abort_requested() {
                return Err(self.abort());
            }
            if self.autocommit {
                self.commit()?;
            }
            return Ok(result);
        }
    }

    /// Open a transaction explicitly
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.begin_transaction(&mut self.state);
        Ok(())
    }

    /// Commit the open transaction and release its locks
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.coordinator.commit_transaction(&mut self.state)? {
            true => Ok(()),
            false => Err(self.abort()),
        }
    }

    /// Assign the commit-phase action timestamp; fails if the transaction
    /// has been marked for abort
    pub fn prepare_commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.coordinator.prepare_commit_actions(&mut self.state) {
            Ok(())
        } else {
            Err(self.abort())
        }
    }

    /// Undo the open transaction and release its locks
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state.is_transaction() {
            self.log_statement("ROLLBACK");
        }
        self.coordinator.rollback(&mut self.state);
        Ok(())
    }

    /// Set a savepoint, replacing an existing one with the same name
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.savepoint(name);
        self.log_statement(&format!("SAVEPOINT \"{}\"", name));
        Ok(())
    }

    /// Undo the actions recorded after the named savepoint, keeping the
    /// savepoint
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.rollback_to_savepoint(&mut self.state, name)?;
        self.log_statement(&format!("ROLLBACK TO SAVEPOINT \"{}\"", name));
        Ok(())
    }

    /// Undo the actions recorded after the first savepoint
    pub fn rollback_to_first_savepoint(&mut self) -> Result<()> {
        self.ensure_open()?;
        let name = match self.state.savepoints().first() {
            Some(savepoint) => savepoint.name.clone(),
            None => return Err(Error::SavepointNotFound("#0".to_string())),
        };
        self.coordinator.rollback_savepoint(&mut self.state, 0)?;
        self.log_statement(&format!("ROLLBACK TO SAVEPOINT \"{}\"", name));
        Ok(())
    }

    /// Remove the named savepoint and every savepoint set after it
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let index = self
            .state
            .savepoint_index(name)
            .ok_or_else(|| Error::SavepointNotFound(name.to_string()))?;
        self.state.release_savepoint_at(index);
        Ok(())
    }

    /// Switch autocommit; an open transaction is committed first
    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.ensure_open()?;
        if autocommit != self.autocommit && self.state.is_transaction() {
            self.commit()?;
        }
        self.autocommit = autocommit;
        Ok(())
    }

    /// Set the isolation level of the next transaction
    pub fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        self.state.set_isolation(isolation)
    }

    /// Set the isolation level each transaction of this session starts with
    pub fn set_isolation_default(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        self.state.set_isolation_default(isolation);
        Ok(())
    }

    /// Make the next transaction read only, or read write again
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        self.state.set_read_only(read_only)
    }

    pub fn set_read_only_default(&mut self, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        self.state.set_read_only_default(read_only);
        Ok(())
    }

    pub fn set_lock_wait_timeout(&mut self, timeout: Option<Duration>) {
        self.lock_wait_timeout = timeout;
    }

    /// Move the database to another concurrency control variant.
    ///
    /// Refused while other sessions hold or wait for locks. `Locks` is the
    /// only variant `build_coordinator` can construct, so any other mode ends
    /// with `UnsupportedTransactionControl` once the handoff has been taken.
    pub fn set_transaction_control(&mut self, mode: TransactionControl) -> Result<()> {
        self.ensure_open()?;
        if self.coordinator.transaction_control() == mode {
            return Ok(());
        }
        let handoff = self.coordinator.handoff(&self.state, mode)?;
        build_coordinator(mode, handoff, self.db.logger().clone()).map(|_| ())
    }

    /// Roll back any open transaction and detach from the coordinator
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.coordinator.unregister_session(&mut self.state);
        self.closed = true;
        info!(session = self.id(), "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
