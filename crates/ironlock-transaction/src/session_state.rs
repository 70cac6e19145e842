//! Per-session transactional state

use crate::lock_table::LockRequest;
use crate::row_action::RowAction;
use crate::signals::SessionSignals;
use hashbrown::HashMap;
use ironlock_common::{ActionType, Error, IsolationLevel, Result, RowId, SessionId, Timestamp};
use std::sync::Arc;

/// A named point in the action log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    /// Action log length when the savepoint was set
    pub log_length: usize,
    /// Action timestamp when the savepoint was set
    pub timestamp: Timestamp,
}

/// Transactional context of one session.
///
/// Owned by the session; the coordinator only borrows it for the duration of
/// a call. The action log grows while a transaction is open, shrinks to a
/// prefix on statement or savepoint rollback and is cleared when the
/// transaction ends.
#[derive(Debug)]
pub struct SessionTxState {
    session_id: SessionId,
    signals: Arc<SessionSignals>,
    /// Characteristics of the current (or next) transaction
    isolation: IsolationLevel,
    read_only: bool,
    /// Characteristics every transaction starts from
    isolation_default: IsolationLevel,
    read_only_default: bool,

    pub(crate) is_transaction: bool,
    pub(crate) transaction_timestamp: Timestamp,
    pub(crate) action_timestamp: Timestamp,
    pub(crate) transaction_end_timestamp: Timestamp,

    action_log: Vec<RowAction>,
    /// Start of the current statement's actions
    pub(crate) action_index: usize,
    /// Row id -> indexes of its actions in the log
    row_actions: HashMap<RowId, Vec<usize>>,
    savepoints: Vec<Savepoint>,

    /// Lock set of the statement being executed
    pub(crate) current_request: Option<LockRequest>,
    /// Lock set known to be held, for the fast path of `begin_action`
    pub(crate) granted: Option<LockRequest>,
}

impl SessionTxState {
    pub fn new(session_id: SessionId, signals: Arc<SessionSignals>, isolation: IsolationLevel) -> Self {
        SessionTxState {
            session_id,
            signals,
            isolation,
            read_only: false,
            isolation_default: isolation,
            read_only_default: false,
            is_transaction: false,
            transaction_timestamp: 0,
            action_timestamp: 0,
            transaction_end_timestamp: 0,
            action_log: Vec::new(),
            action_index: 0,
            row_actions: HashMap::new(),
            savepoints: Vec::new(),
            current_request: None,
            granted: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn signals(&self) -> &Arc<SessionSignals> {
        &self.signals
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Set the isolation level of the next transaction only; refused while
    /// a transaction is open
    pub fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.is_transaction {
            return Err(Error::TransactionInProgress);
        }
        self.isolation = isolation;
        Ok(())
    }

    pub fn isolation_default(&self) -> IsolationLevel {
        self.isolation_default
    }

    /// Set the isolation level every later transaction starts with. Applies
    /// at once unless a transaction is open.
    pub fn set_isolation_default(&mut self, isolation: IsolationLevel) {
        self.isolation_default = isolation;
        if !self.is_transaction {
            self.isolation = isolation;
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Make the next transaction read only or read write; refused while a
    /// transaction is open
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        if self.is_transaction {
            return Err(Error::TransactionInProgress);
        }
        self.read_only = read_only;
        Ok(())
    }

    pub fn read_only_default(&self) -> bool {
        self.read_only_default
    }

    /// Set the access mode every later transaction starts with. Applies at
    /// once unless a transaction is open.
    pub fn set_read_only_default(&mut self, read_only: bool) {
        self.read_only_default = read_only;
        if !self.is_transaction {
            self.read_only = read_only;
        }
    }

    pub fn is_transaction(&self) -> bool {
        self.is_transaction
    }

    pub fn transaction_timestamp(&self) -> Timestamp {
        self.transaction_timestamp
    }

    pub fn action_timestamp(&self) -> Timestamp {
        self.action_timestamp
    }

    pub fn transaction_end_timestamp(&self) -> Timestamp {
        self.transaction_end_timestamp
    }

    pub fn action_index(&self) -> usize {
        self.action_index
    }

    // Action log

    pub fn actions(&self) -> &[RowAction] {
        &self.action_log
    }

    pub(crate) fn actions_mut(&mut self) -> &mut [RowAction] {
        &mut self.action_log
    }

    pub fn action_count(&self) -> usize {
        self.action_log.len()
    }

    pub(crate) fn push_action(&mut self, action: RowAction) {
        let index = self.action_log.len();
        self.row_actions
            .entry(action.row_id())
            .or_default()
            .push(index);
        self.action_log.push(action);
    }

    /// Remove and return the actions from `start` on, in log order
    pub(crate) fn truncate_actions(&mut self, start: usize) -> Vec<RowAction> {
        if start >= self.action_log.len() {
            return Vec::new();
        }
        let removed = self.action_log.split_off(start);
        for action in removed.iter().rev() {
            if let Some(indexes) = self.row_actions.get_mut(&action.row_id()) {
                indexes.pop();
                if indexes.is_empty() {
                    self.row_actions.remove(&action.row_id());
                }
            }
        }
        self.action_index = self.action_index.min(start);
        removed
    }

    /// Whether the log still holds an action on `row`
    pub fn has_row_actions(&self, row: RowId) -> bool {
        self.row_actions.contains_key(&row)
    }

    /// Whether `row` was inserted by the open transaction
    pub fn inserted_in_transaction(&self, row: RowId) -> bool {
        self.row_actions.get(&row).map_or(false, |indexes| {
            indexes
                .iter()
                .any(|i| self.action_log[*i].action_type() == ActionType::Insert)
        })
    }

    /// Ids of every row the log touches
    pub(crate) fn touched_rows(&self) -> Vec<RowId> {
        self.row_actions.keys().copied().collect()
    }

    // Savepoints

    /// Set a savepoint at the current end of the log, replacing any savepoint
    /// with the same name
    pub fn savepoint(&mut self, name: &str) {
        if let Some(index) = self.savepoint_index(name) {
            self.savepoints.remove(index);
        }
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            log_length: self.action_log.len(),
            timestamp: self.action_timestamp,
        });
    }

    pub fn savepoint_index(&self, name: &str) -> Option<usize> {
        self.savepoints.iter().position(|sp| sp.name == name)
    }

    pub fn savepoints(&self) -> &[Savepoint] {
        &self.savepoints
    }

    pub(crate) fn truncate_savepoints(&mut self, len: usize) {
        self.savepoints.truncate(len);
    }

    /// Remove the savepoint at `index` and every savepoint set after it
    pub fn release_savepoint_at(&mut self, index: usize) {
        self.savepoints.truncate(index);
    }

    /// Reset everything tied to the transaction that just ended
    pub(crate) fn clear_transaction(&mut self) {
        self.is_transaction = false;
        self.action_log.clear();
        self.row_actions.clear();
        self.savepoints.clear();
        self.action_index = 0;
        self.current_request = None;
        self.granted = None;
        self.isolation = self.isolation_default;
        self.read_only = self.read_only_default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironlock_common::Value;
    use ironlock_storage::{MemoryRowStore, PersistentStore};
    use std::sync::atomic::AtomicU64;

    fn state() -> SessionTxState {
        SessionTxState::new(1, Arc::new(SessionSignals::new()), IsolationLevel::ReadCommitted)
    }

    fn insert(state: &mut SessionTxState, store: &Arc<dyn PersistentStore>) -> RowId {
        let row = store.new_row(vec![Value::Integer(0)]);
        state.push_action(RowAction::insert(1, 1, store.clone(), &row));
        row.id
    }

    fn store() -> Arc<dyn PersistentStore> {
        Arc::new(MemoryRowStore::new(1, Arc::new(AtomicU64::new(1))))
    }

    #[test]
    fn test_savepoint_name_reuse_replaces() {
        let store = store();
        let mut state = state();
        state.savepoint("a");
        insert(&mut state, &store);
        state.savepoint("b");
        insert(&mut state, &store);
        state.savepoint("a");

        let names: Vec<_> = state.savepoints().iter().map(|sp| sp.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(state.savepoints()[1].log_length, 2);
    }

    #[test]
    fn test_release_drops_later_savepoints() {
        let mut state = state();
        state.savepoint("a");
        state.savepoint("b");
        state.savepoint("c");
        let index = state.savepoint_index("b").unwrap();
        state.release_savepoint_at(index);
        assert_eq!(state.savepoints().len(), 1);
        assert_eq!(state.savepoints()[0].name, "a");
    }

    #[test]
    fn test_truncate_tracks_rows() {
        let store = store();
        let mut state = state();
        let first = insert(&mut state, &store);
        let second = insert(&mut state, &store);
        state.action_index = 2;

        let removed = state.truncate_actions(1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].row_id(), second);
        assert!(state.has_row_actions(first));
        assert!(!state.has_row_actions(second));
        assert_eq!(state.action_index(), 1);
        assert!(state.inserted_in_transaction(first));
    }

    #[test]
    fn test_clear_transaction() {
        let store = store();
        let mut state = state();
        state.is_transaction = true;
        insert(&mut state, &store);
        state.savepoint("a");
        state.clear_transaction();
        assert!(!state.is_transaction());
        assert_eq!(state.action_count(), 0);
        assert!(state.savepoints().is_empty());
        assert!(state.touched_rows().is_empty());
    }

    #[test]
    fn test_characteristics_last_one_transaction() {
        let mut state = state();
        state.set_isolation(IsolationLevel::Serializable).unwrap();
        state.set_read_only(true).unwrap();
        state.is_transaction = true;

        assert!(matches!(
            state.set_isolation(IsolationLevel::ReadCommitted),
            Err(Error::TransactionInProgress)
        ));
        assert!(matches!(state.set_read_only(false), Err(Error::TransactionInProgress)));
        assert_eq!(state.isolation(), IsolationLevel::Serializable);

        state.clear_transaction();
        assert_eq!(state.isolation(), IsolationLevel::ReadCommitted);
        assert!(!state.is_read_only());
    }

    #[test]
    fn test_default_applies_after_open_transaction() {
        let mut state = state();
        state.is_transaction = true;
        state.set_isolation_default(IsolationLevel::RepeatableRead);
        state.set_read_only_default(true);
        assert_eq!(state.isolation(), IsolationLevel::ReadCommitted);
        assert!(!state.is_read_only());

        state.clear_transaction();
        assert_eq!(state.isolation(), IsolationLevel::RepeatableRead);
        assert!(state.is_read_only());
    }
}
