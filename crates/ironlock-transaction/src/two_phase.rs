//! Table-level two-phase locking coordinator

use crate::clock::LogicalClock;
use crate::control::{BeginAction, ClockHandoff, ConcurrencyControl};
use crate::lock_table::{Acquire, LockMode, LockRequest, LockTable};
use crate::ownership::RowOwnership;
use crate::row_action::RowAction;
use crate::session_state::SessionTxState;
use crate::signals::SessionSignals;
use hashbrown::{HashMap, HashSet};
use ironlock_common::{
    ActionType, Error, IsolationLevel, Result, RowId, SessionId, TableId, Timestamp,
    TransactionControl,
};
use ironlock_storage::{Logger, PersistentStore, Row};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Everything guarded by the coordinator's write lock
struct CoordinatorState {
    clock: LogicalClock,
    locks: LockTable,
    ownership: RowOwnership,
    /// Signals of every registered session, used to wake waiters
    sessions: HashMap<SessionId, Arc<SessionSignals>>,
    transaction_count: usize,
}

impl CoordinatorState {
    /// Release every lock of `session`, drop it from the wait queue and
    /// wake the waiters this unblocks
    fn release_locks(&mut self, session: SessionId) {
        let released = self.locks.release_all(session);
        let was_waiting = self.locks.cancel_wait(session);
        if released > 0 || was_waiting {
            self.promote();
        }
    }

    /// Grant whatever the queue now allows and wake the granted sessions
    fn promote(&mut self) {
        for waiter in self.locks.promote_waiters() {
            debug!(session = waiter, "lock wait granted");
            if let Some(signals) = self.sessions.get(&waiter) {
                signals.latch().count_down();
            }
        }
    }

    fn end_transaction(&mut self, state: &SessionTxState) {
        if state.is_transaction {
            self.transaction_count = self.transaction_count.saturating_sub(1);
        }
    }
}

/// The table-level 2PL transaction coordinator.
///
/// All lock and clock bookkeeping happens under one mutex held for short
/// critical sections only. Sessions wait on their own latch with the mutex
/// released, and row-level work in the stores runs outside it except where a
/// delete must be checked and recorded atomically.
pub struct TwoPhaseLocking {
    inner: Mutex<CoordinatorState>,
    next_session_id: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl TwoPhaseLocking {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        TwoPhaseLocking {
            inner: Mutex::new(CoordinatorState {
                clock: LogicalClock::default(),
                locks: LockTable::new(),
                ownership: RowOwnership::new(),
                sessions: HashMap::new(),
                transaction_count: 0,
            }),
            next_session_id: AtomicU64::new(1),
            logger,
        }
    }

    /// Build a coordinator whose clock continues after `handoff`
    pub fn from_handoff(handoff: ClockHandoff, logger: Arc<dyn Logger>) -> Result<Self> {
        handoff.validate()?;
        let coordinator = Self::new(logger);
        coordinator.inner.lock().clock = LogicalClock::new(handoff.global_change_timestamp);
        Ok(coordinator)
    }

    /// Locks currently held by a session
    pub fn held_locks(&self, session: SessionId) -> Vec<(TableId, LockMode)> {
        self.inner.lock().locks.held_by(session)
    }

    /// Number of rows with an uncommitted owner
    pub fn owned_row_count(&self) -> usize {
        self.inner.lock().ownership.len()
    }

    /// Undo the actions from `start` to the end of the log, newest first.
    ///
    /// Returns the rows no longer touched by any remaining action.
    fn undo_to(&self, state: &mut SessionTxState, start: usize, timestamp: Timestamp) -> Vec<RowId> {
        let mut undone = state.truncate_actions(start);
        for action in undone.iter_mut().rev() {
            let action_type = action.action_type();
            match action.rollback(timestamp) {
                Ok(true) => trace!(
                    session = state.session_id(),
                    row = action.row_id(),
                    table = action.table(),
                    %action_type,
                    "undo row action"
                ),
                Ok(false) => {}
                Err(e) => warn!(
                    session = state.session_id(),
                    row = action.row_id(),
                    error = %e,
                    "failed to undo row action"
                ),
            }
        }
        let mut rows: Vec<RowId> = undone
            .iter()
            .map(|action| action.row_id())
            .filter(|row| !state.has_row_actions(*row))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    /// Release the read locks of the finished statement under READ COMMITTED
    fn end_action(&self, state: &mut SessionTxState) {
        let request = state.current_request.take();
        if state.isolation().holds_read_locks() {
            return;
        }
        let reads = match request {
            Some(request) if !request.reads().is_empty() => request,
            _ => return,
        };
        let session = state.session_id();
        let mut inner = self.inner.lock();
        if inner.locks.release_shared(session, reads.reads()) > 0 {
            inner.promote();
        }
        state.granted = None;
    }

    /// Write the row actions and the commit record of the transaction
    fn persist_commit(&self, state: &SessionTxState, timestamp: Timestamp) -> Result<()> {
        let actions = state.actions();
        if actions.is_empty() {
            return Ok(());
        }
        let session = state.session_id();
        // Rows inserted and deleted again never reach the log
        let transient: HashSet<RowId> = actions
            .iter()
            .filter(|action| action.action_type() == ActionType::InsertThenDelete)
            .map(|action| action.row_id())
            .collect();
        for action in actions {
            if transient.contains(&action.row_id()) {
                continue;
            }
            if let Some(row) = action.resolve_row() {
                self.logger
                    .write_row_action(session, action.action_type(), &row)?;
            }
        }
        self.logger.write_commit(session, timestamp)
    }
}

impl ConcurrencyControl for TwoPhaseLocking {
    fn transaction_control(&self) -> TransactionControl {
        TransactionControl::Locks
    }

    fn global_change_timestamp(&self) -> Timestamp {
        self.inner.lock().clock.current()
    }

    fn transaction_count(&self) -> usize {
        self.inner.lock().transaction_count
    }

    fn register_session(&self, isolation: IsolationLevel) -> SessionTxState {
        let session = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let signals = Arc::new(SessionSignals::new());
        self.inner.lock().sessions.insert(session, signals.clone());
        debug!(session, ?isolation, "session registered");
        SessionTxState::new(session, signals, isolation)
    }

    fn unregister_session(&self, state: &mut SessionTxState) {
        let session = state.session_id();
        let holds_locks = !self.inner.lock().locks.held_by(session).is_empty();
        if state.is_transaction || holds_locks {
            self.rollback(state);
        }
        let mut inner = self.inner.lock();
        if inner.locks.cancel_wait(session) {
            inner.promote();
        }
        inner.sessions.remove(&session);
        debug!(session, "session unregistered");
    }

    fn begin_transaction(&self, state: &mut SessionTxState) {
        if state.is_transaction {
            return;
        }
        let mut inner = self.inner.lock();
        let timestamp = inner.clock.next();
        inner.transaction_count += 1;
        state.transaction_timestamp = timestamp;
        state.action_timestamp = timestamp;
        state.is_transaction = true;
        debug!(session = state.session_id(), timestamp, "begin transaction");
    }

    fn begin_action(&self, state: &mut SessionTxState, request: &LockRequest) -> Result<BeginAction> {
        state.action_index = state.action_count();
        state.current_request = Some(request.clone());
        if state.signals().is_abort_requested() {
            return Err(Error::SerializationFailure);
        }
        if state.granted.as_ref() == Some(request) {
            return Ok(BeginAction::Proceed);
        }

        let session = state.session_id();
        let mut inner = self.inner.lock();
        match inner.locks.acquire(session, request) {
            Acquire::Granted => {
                state.granted = Some(request.clone());
                debug!(
                    session,
                    reads = ?request.reads(),
                    writes = ?request.writes(),
                    "locks granted"
                );
                Ok(BeginAction::Proceed)
            }
            Acquire::Wait(blockers) => {
                state.signals().latch().set_count(1);
                debug!(session, ?blockers, "waiting for locks");
                Ok(BeginAction::MustWait)
            }
            Acquire::Deadlock(blockers) => {
                inner.promote();
                state.signals().raise_abort();
                debug!(session, ?blockers, "wait refused, would close a cycle");
                Err(Error::SerializationFailure)
            }
        }
    }

    fn begin_action_resume(&self, state: &mut SessionTxState) -> Result<()> {
        if state.signals().is_abort_requested() {
            return Err(Error::SerializationFailure);
        }
        let mut inner = self.inner.lock();
        let timestamp = inner.clock.next();
        state.action_timestamp = timestamp;
        if !state.is_transaction {
            state.transaction_timestamp = timestamp;
            state.is_transaction = true;
            inner.transaction_count += 1;
        }
        Ok(())
    }

    fn cancel_wait(&self, state: &mut SessionTxState) {
        let mut inner = self.inner.lock();
        if inner.locks.cancel_wait(state.session_id()) {
            inner.promote();
        }
        drop(inner);
        state.signals().latch().release();
    }

    fn complete_actions(&self, state: &mut SessionTxState) {
        state.action_index = state.action_count();
        self.end_action(state);
    }

    fn rollback_action(&self, state: &mut SessionTxState) {
        let start = state.action_index;
        let timestamp = state.action_timestamp;
        let rows = self.undo_to(state, start, timestamp);
        if !rows.is_empty() {
            self.inner.lock().ownership.release_rows(&rows);
        }
        self.end_action(state);
    }

    fn prepare_commit_actions(&self, state: &mut SessionTxState) -> bool {
        let mut inner = self.inner.lock();
        if state.signals().is_abort_requested() {
            return false;
        }
        state.action_timestamp = inner.clock.next();
        true
    }

    fn commit_transaction(&self, state: &mut SessionTxState) -> Result<bool> {
        let session = state.session_id();
        let mut inner = self.inner.lock();
        if state.signals().is_abort_requested() {
            return Ok(false);
        }
        let timestamp = inner.clock.next();

        if let Err(e) = self.persist_commit(state, timestamp) {
            drop(inner);
            warn!(session, timestamp, error = %e, "commit log write failed, rolling back");
            self.rollback(state);
            return Err(Error::FatalStore(e.to_string()));
        }

        // The commit record is durable from here on, so a store that fails
        // to finalize a row does not stop the locks from being released
        let mut finalize_error = None;
        for action in state.actions_mut() {
            let final_type = action.commit(timestamp);
            if let Some(row) = action.resolve_row() {
                if let Err(e) = action.store().commit_row(&row, final_type) {
                    warn!(session, row = row.id, error = %e, "failed to finalize row");
                    finalize_error.get_or_insert(e);
                }
            }
        }

        let rows = state.touched_rows();
        inner.ownership.release_rows(&rows);
        inner.end_transaction(state);
        inner.release_locks(session);
        drop(inner);

        debug!(session, timestamp, actions = state.action_count(), "commit");
        state.action_timestamp = timestamp;
        state.transaction_end_timestamp = timestamp;
        state.clear_transaction();
        match finalize_error {
            Some(e) => Err(Error::FatalStore(format!(
                "transaction committed at {} but a row was not finalized: {}",
                timestamp, e
            ))),
            None => Ok(true),
        }
    }

    fn rollback(&self, state: &mut SessionTxState) {
        let session = state.session_id();
        state.signals().clear_abort();
        state.signals().take_redo();
        let timestamp = self.inner.lock().clock.next();

        let actions = state.action_count();
        let rows = self.undo_to(state, 0, timestamp);

        let mut inner = self.inner.lock();
        inner.ownership.release_rows(&rows);
        inner.end_transaction(state);
        inner.release_locks(session);
        drop(inner);

        state.signals().latch().release();
        debug!(session, timestamp, actions, "rollback");
        state.action_timestamp = timestamp;
        state.transaction_end_timestamp = timestamp;
        state.clear_transaction();
    }

    fn rollback_savepoint(&self, state: &mut SessionTxState, index: usize) -> Result<()> {
        let savepoint = state
            .savepoints()
            .get(index)
            .cloned()
            .ok_or_else(|| Error::SavepointNotFound(format!("#{}", index)))?;
        let rows = self.undo_to(state, savepoint.log_length, savepoint.timestamp);
        state.truncate_savepoints(index + 1);
        if !rows.is_empty() {
            self.inner.lock().ownership.release_rows(&rows);
        }
        debug!(
            session = state.session_id(),
            savepoint = %savepoint.name,
            log_length = savepoint.log_length,
            "rollback to savepoint"
        );
        Ok(())
    }

    fn add_insert_action(
        &self,
        state: &mut SessionTxState,
        store: &Arc<dyn PersistentStore>,
        row: Arc<Row>,
    ) -> Result<()> {
        let session = state.session_id();
        store.index_row(row.clone())?;
        self.inner.lock().ownership.claim(session, row.id);
        state.push_action(RowAction::insert(
            session,
            state.action_timestamp,
            store.clone(),
            &row,
        ));
        Ok(())
    }

    fn add_delete_action(
        &self,
        state: &mut SessionTxState,
        store: &Arc<dyn PersistentStore>,
        row: &Arc<Row>,
    ) -> Result<()> {
        let session = state.session_id();
        {
            let mut inner = self.inner.lock();
            inner.ownership.check(session, row.id)?;
            store.delete(row)?;
            inner.ownership.claim(session, row.id);
        }
        let inserted_here = state.inserted_in_transaction(row.id);
        state.push_action(RowAction::delete(
            session,
            state.action_timestamp,
            store.clone(),
            row,
            inserted_here,
        ));
        Ok(())
    }

    fn check_delete(&self, state: &SessionTxState, rows: &[Arc<Row>]) -> Result<()> {
        self.inner
            .lock()
            .ownership
            .check_all(state.session_id(), rows.iter().map(|row| row.id))
    }

    fn waiting_sessions(&self) -> Vec<SessionId> {
        self.inner.lock().locks.waiting_sessions()
    }

    fn lock_holders(&self, table: TableId) -> Vec<(SessionId, LockMode)> {
        self.inner.lock().locks.holders(table)
    }

    fn handoff(&self, state: &SessionTxState, target: TransactionControl) -> Result<ClockHandoff> {
        let inner = self.inner.lock();
        let own_transactions = usize::from(state.is_transaction);
        if !inner.locks.is_idle_except(state.session_id())
            || inner.transaction_count > own_transactions
        {
            return Err(Error::TransactionControlBusy);
        }
        let handoff = ClockHandoff {
            global_change_timestamp: inner.clock.current(),
            live_transaction_timestamps: if state.is_transaction {
                vec![state.transaction_timestamp]
            } else {
                Vec::new()
            },
        };
        handoff.validate()?;
        info!(
            session = state.session_id(),
            ?target,
            timestamp = handoff.global_change_timestamp,
            "transaction control handoff"
        );
        Ok(handoff)
    }
}
