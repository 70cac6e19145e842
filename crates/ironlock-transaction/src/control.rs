//! The concurrency-control interface shared by every coordinator variant

use crate::lock_table::{LockMode, LockRequest};
use crate::session_state::SessionTxState;
use crate::two_phase::TwoPhaseLocking;
use ironlock_common::{
    Error, IsolationLevel, Result, SessionId, TableId, Timestamp, TransactionControl,
};
use ironlock_storage::{Logger, PersistentStore, Row};
use std::sync::Arc;

/// Result of asking for the locks of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginAction {
    /// Every lock is held; the statement may run
    Proceed,
    /// The session was queued and must wait on its latch, then call
    /// `begin_action` again
    MustWait,
}

/// Clock state carried from one coordinator variant to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockHandoff {
    pub global_change_timestamp: Timestamp,
    /// Transaction timestamps of the transactions still open
    pub live_transaction_timestamps: Vec<Timestamp>,
}

impl ClockHandoff {
    /// Check that no live transaction claims a timestamp the clock has not
    /// reached yet
    pub fn validate(&self) -> Result<()> {
        match self
            .live_transaction_timestamps
            .iter()
            .find(|ts| **ts > self.global_change_timestamp)
        {
            Some(ts) => Err(Error::Internal(format!(
                "transaction timestamp {} is ahead of the clock at {}",
                ts, self.global_change_timestamp
            ))),
            None => Ok(()),
        }
    }
}

/// A transaction coordinator.
///
/// Sessions own their `SessionTxState` and lend it to the coordinator for
/// each call. Implementations guard their shared state with one mutex that
/// is never held while a session waits for locks.
pub trait ConcurrencyControl: Send + Sync {
    /// The variant this coordinator implements
    fn transaction_control(&self) -> TransactionControl;

    /// Current value of the logical clock
    fn global_change_timestamp(&self) -> Timestamp;

    /// Number of open transactions
    fn transaction_count(&self) -> usize;

    /// Create the transactional state of a new session
    fn register_session(&self, isolation: IsolationLevel) -> SessionTxState;

    /// Forget a closed session; its transaction must have ended
    fn unregister_session(&self, state: &mut SessionTxState);

    /// Open a transaction unless one is open already
    fn begin_transaction(&self, state: &mut SessionTxState);

    /// Acquire the full lock set of the next statement in one step
    fn begin_action(&self, state: &mut SessionTxState, request: &LockRequest) -> Result<BeginAction>;

    /// Start the statement once its locks are held
    fn begin_action_resume(&self, state: &mut SessionTxState) -> Result<()>;

    /// Leave the wait queue after a cancelled or timed out wait
    fn cancel_wait(&self, state: &mut SessionTxState);

    /// Keep the statement's actions as part of the open transaction
    fn complete_actions(&self, state: &mut SessionTxState);

    /// Undo the actions of the current statement only
    fn rollback_action(&self, state: &mut SessionTxState);

    /// Advance the action timestamp ahead of a commit; false when the
    /// transaction has been marked for abort
    fn prepare_commit_actions(&self, state: &mut SessionTxState) -> bool;

    /// Commit the open transaction.
    ///
    /// Returns `Ok(false)` when the transaction was marked for abort; the
    /// caller must roll back. A logger failure rolls the transaction back
    /// and is returned as `FatalStore`.
    fn commit_transaction(&self, state: &mut SessionTxState) -> Result<bool>;

    /// Undo the whole transaction and release every lock
    fn rollback(&self, state: &mut SessionTxState);

    /// Undo every action recorded after the savepoint at `index`
    fn rollback_savepoint(&self, state: &mut SessionTxState, index: usize) -> Result<()>;

    /// Undo every action recorded after the named savepoint
    fn rollback_to_savepoint(&self, state: &mut SessionTxState, name: &str) -> Result<()> {
        let index = state
            .savepoint_index(name)
            .ok_or_else(|| Error::SavepointNotFound(name.to_string()))?;
        self.rollback_savepoint(state, index)
    }

    /// Index a new row and record its insert
    fn add_insert_action(
        &self,
        state: &mut SessionTxState,
        store: &Arc<dyn PersistentStore>,
        row: Arc<Row>,
    ) -> Result<()>;

    /// Unindex a row and record its delete
    fn add_delete_action(
        &self,
        state: &mut SessionTxState,
        store: &Arc<dyn PersistentStore>,
        row: &Arc<Row>,
    ) -> Result<()>;

    /// Fail with OVERWRITE if another session has an uncommitted action on
    /// any of `rows`
    fn check_delete(&self, state: &SessionTxState, rows: &[Arc<Row>]) -> Result<()>;

    /// Sessions waiting for locks, in registration order
    fn waiting_sessions(&self) -> Vec<SessionId>;

    /// Sessions holding a lock on `table`
    fn lock_holders(&self, table: TableId) -> Vec<(SessionId, LockMode)>;

    /// Hand the clock over to a coordinator of variant `target`.
    ///
    /// Refused while any session other than the caller holds or waits for
    /// locks.
    fn handoff(&self, state: &SessionTxState, target: TransactionControl) -> Result<ClockHandoff>;
}

/// Build the coordinator for `mode`, resuming the clock from `handoff`
pub fn build_coordinator(
    mode: TransactionControl,
    handoff: ClockHandoff,
    logger: Arc<dyn Logger>,
) -> Result<Arc<dyn ConcurrencyControl>> {
    match mode {
        TransactionControl::Locks => Ok(Arc::new(TwoPhaseLocking::from_handoff(handoff, logger)?)),
        other => Err(Error::UnsupportedTransactionControl(other)),
    }
}
