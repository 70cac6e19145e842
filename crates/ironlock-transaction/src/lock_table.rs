//! Table lock holders and the wait-for relation

use hashbrown::{HashMap, HashSet};
use ironlock_common::{SessionId, TableId};
use std::collections::{BTreeMap, BTreeSet};

/// Table lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Read access, shared with other readers
    Shared,
    /// Write access, excludes every other session
    Exclusive,
}

/// The complete set of tables a statement needs, requested in one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    reads: Vec<TableId>,
    writes: Vec<TableId>,
}

impl LockRequest {
    /// Build a request; tables listed for both read and write are only
    /// requested for write
    pub fn new<R, W>(reads: R, writes: W) -> Self
    where
        R: IntoIterator<Item = TableId>,
        W: IntoIterator<Item = TableId>,
    {
        let writes: BTreeSet<TableId> = writes.into_iter().collect();
        let reads: BTreeSet<TableId> = reads
            .into_iter()
            .filter(|table| !writes.contains(table))
            .collect();
        LockRequest {
            reads: reads.into_iter().collect(),
            writes: writes.into_iter().collect(),
        }
    }

    pub fn read(tables: &[TableId]) -> Self {
        Self::new(tables.iter().copied(), [])
    }

    pub fn write(tables: &[TableId]) -> Self {
        Self::new([], tables.iter().copied())
    }

    pub fn reads(&self) -> &[TableId] {
        &self.reads
    }

    pub fn writes(&self) -> &[TableId] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Whether the request allows writing `table`
    pub fn allows_write(&self, table: TableId) -> bool {
        self.writes.binary_search(&table).is_ok()
    }

    /// Whether the request allows reading `table`
    pub fn allows_read(&self, table: TableId) -> bool {
        self.allows_write(table) || self.reads.binary_search(&table).is_ok()
    }

    /// Whether the two requests could not be held at the same time by
    /// different sessions
    pub fn conflicts_with(&self, other: &LockRequest) -> bool {
        self.writes.iter().any(|table| other.allows_read(*table))
            || other.writes.iter().any(|table| self.allows_read(*table))
    }
}

/// Outcome of asking for the locks of a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// Every lock of the request is now held by the session
    Granted,
    /// The session is queued behind these sessions
    Wait(Vec<SessionId>),
    /// Waiting behind these sessions would close a cycle
    Deadlock(Vec<SessionId>),
}

#[derive(Debug)]
struct Waiter {
    session: SessionId,
    request: LockRequest,
    /// Not held back by earlier conflicting waiters, which were already
    /// waiting on this session when it was queued
    barging: bool,
}

/// Table locks of all sessions plus the waiters queued behind them.
///
/// Requests are granted whole or not at all. A blocked session waits on every
/// session holding a conflicting lock and on every conflicting session queued
/// before it, so a stream of readers cannot starve a queued writer. The one
/// exception is a session that earlier waiters already wait on: it only waits
/// for holders, since queueing it behind them would close a cycle.
///
/// The wait-for relation is derived from the current holders and queue every
/// time it is read. Grants made after a session was queued are therefore part
/// of it, and a cycle can only appear when a session is queued, which
/// `acquire` refuses.
#[derive(Debug, Default)]
pub struct LockTable {
    exclusive: HashMap<TableId, SessionId>,
    shared: HashMap<TableId, BTreeSet<SessionId>>,
    held: HashMap<SessionId, BTreeMap<TableId, LockMode>>,
    /// Registration sequence -> waiter
    waiters: BTreeMap<u64, Waiter>,
    waiter_seq: HashMap<SessionId, u64>,
    next_seq: u64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `session` already holds every lock of `request`
    pub fn holds(&self, session: SessionId, request: &LockRequest) -> bool {
        let held = match self.held.get(&session) {
            Some(held) => held,
            None => return request.is_empty(),
        };
        request
            .writes()
            .iter()
            .all(|table| held.get(table) == Some(&LockMode::Exclusive))
            && request.reads().iter().all(|table| held.contains_key(table))
    }

    /// Sessions holding locks that conflict with `request`, in id order
    pub fn conflicting_holders(&self, session: SessionId, request: &LockRequest) -> Vec<SessionId> {
        let mut holders = BTreeSet::new();
        for table in request.writes() {
            if let Some(holder) = self.exclusive.get(table) {
                holders.insert(*holder);
            }
            if let Some(readers) = self.shared.get(table) {
                holders.extend(readers.iter().copied());
            }
        }
        for table in request.reads() {
            if let Some(holder) = self.exclusive.get(table) {
                holders.insert(*holder);
            }
        }
        holders.remove(&session);
        holders.into_iter().collect()
    }

    /// Waiters queued before `before` (or anywhere, if `None`) whose requests
    /// conflict with `request`, in id order
    fn queued_ahead(&self, session: SessionId, request: &LockRequest, before: Option<u64>) -> Vec<SessionId> {
        let queued = match before {
            Some(seq) => self.waiters.range(..seq),
            None => self.waiters.range(..),
        };
        let ahead: BTreeSet<SessionId> = queued
            .filter(|(_, w)| w.session != session && w.request.conflicts_with(request))
            .map(|(_, w)| w.session)
            .collect();
        ahead.into_iter().collect()
    }

    /// Grant `request` to `session` or queue it, refusing a wait that would
    /// close a cycle.
    ///
    /// A session that is already queued keeps its place.
    pub fn acquire(&mut self, session: SessionId, request: &LockRequest) -> Acquire {
        if self.holds(session, request) {
            self.cancel_wait(session);
            return Acquire::Granted;
        }

        let own_seq = self.waiter_seq.get(&session).copied();
        let holders = self.conflicting_holders(session, request);
        let ahead = self.queued_ahead(session, request, own_seq);
        if holders.is_empty() && ahead.is_empty() {
            self.cancel_wait(session);
            self.grant(session, request);
            return Acquire::Granted;
        }

        let blockers: Vec<SessionId> = holders
            .iter()
            .chain(ahead.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !self.would_deadlock(session, &blockers) {
            self.enqueue(session, request.clone(), false);
            return Acquire::Wait(blockers);
        }
        if self.would_deadlock(session, &holders) {
            self.cancel_wait(session);
            return Acquire::Deadlock(blockers);
        }

        // Earlier waiters already wait on this session
        if holders.is_empty() {
            self.cancel_wait(session);
            self.grant(session, request);
            Acquire::Granted
        } else {
            self.enqueue(session, request.clone(), true);
            Acquire::Wait(holders)
        }
    }

    /// Grant every lock of `request` to `session`
    pub fn grant(&mut self, session: SessionId, request: &LockRequest) {
        let held = self.held.entry(session).or_default();
        for table in request.writes() {
            debug_assert!(
                self.exclusive.get(table).map_or(true, |holder| *holder == session),
                "table {} granted to two writers",
                table
            );
            self.exclusive.insert(*table, session);
            if let Some(readers) = self.shared.get_mut(table) {
                readers.remove(&session);
                if readers.is_empty() {
                    self.shared.remove(table);
                }
            }
            held.insert(*table, LockMode::Exclusive);
        }
        for table in request.reads() {
            if held.get(table) == Some(&LockMode::Exclusive) {
                continue;
            }
            self.shared.entry(*table).or_default().insert(session);
            held.insert(*table, LockMode::Shared);
        }
    }

    /// Whether making `session` wait behind `blockers` would close a cycle
    pub fn would_deadlock(&self, session: SessionId, blockers: &[SessionId]) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<SessionId> = blockers.to_vec();
        while let Some(current) = stack.pop() {
            if current == session {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(self.blocked_by(current));
        }
        false
    }

    fn enqueue(&mut self, session: SessionId, request: LockRequest, barging: bool) {
        let seq = match self.waiter_seq.get(&session) {
            Some(seq) => *seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.waiter_seq.insert(session, seq);
                seq
            }
        };
        self.waiters.insert(
            seq,
            Waiter {
                session,
                request,
                barging,
            },
        );
    }

    /// Remove `session` from the wait queue. Waiters queued behind it may
    /// become grantable, see `promote_waiters`.
    pub fn cancel_wait(&mut self, session: SessionId) -> bool {
        match self.waiter_seq.remove(&session) {
            Some(seq) => self.waiters.remove(&seq).is_some(),
            None => false,
        }
    }

    pub fn is_waiting(&self, session: SessionId) -> bool {
        self.waiter_seq.contains_key(&session)
    }

    /// Waiting sessions in registration order
    pub fn waiting_sessions(&self) -> Vec<SessionId> {
        self.waiters.values().map(|w| w.session).collect()
    }

    /// Sessions `session` is currently waiting behind, in id order
    pub fn blocked_by(&self, session: SessionId) -> Vec<SessionId> {
        let seq = match self.waiter_seq.get(&session) {
            Some(seq) => *seq,
            None => return Vec::new(),
        };
        let waiter = match self.waiters.get(&seq) {
            Some(waiter) => waiter,
            None => return Vec::new(),
        };
        let mut blockers: BTreeSet<SessionId> = self
            .conflicting_holders(session, &waiter.request)
            .into_iter()
            .collect();
        if !waiter.barging {
            blockers.extend(self.queued_ahead(session, &waiter.request, Some(seq)));
        }
        blockers.into_iter().collect()
    }

    /// Holders of locks on `table`
    pub fn holders(&self, table: TableId) -> Vec<(SessionId, LockMode)> {
        let mut holders = Vec::new();
        if let Some(holder) = self.exclusive.get(&table) {
            holders.push((*holder, LockMode::Exclusive));
        }
        if let Some(readers) = self.shared.get(&table) {
            holders.extend(readers.iter().map(|s| (*s, LockMode::Shared)));
        }
        holders
    }

    /// Locks held by `session`, in table order
    pub fn held_by(&self, session: SessionId) -> Vec<(TableId, LockMode)> {
        self.held
            .get(&session)
            .map(|held| held.iter().map(|(t, m)| (*t, *m)).collect())
            .unwrap_or_default()
    }

    /// Whether no session other than `session` holds or awaits a lock
    pub fn is_idle_except(&self, session: SessionId) -> bool {
        self.held.keys().all(|s| *s == session)
            && self.waiters.values().all(|w| w.session == session)
    }

    /// Release every lock of `session`; returns the number released
    pub fn release_all(&mut self, session: SessionId) -> usize {
        let held = match self.held.remove(&session) {
            Some(held) => held,
            None => return 0,
        };
        for (table, mode) in &held {
            self.unlock(session, *table, *mode);
        }
        held.len()
    }

    /// Release the shared locks of `session` on `tables`, keeping exclusive ones
    pub fn release_shared(&mut self, session: SessionId, tables: &[TableId]) -> usize {
        let mut released = 0;
        if let Some(held) = self.held.get_mut(&session) {
            for table in tables {
                if held.get(table) == Some(&LockMode::Shared) {
                    held.remove(table);
                    released += 1;
                }
            }
            if held.is_empty() {
                self.held.remove(&session);
            }
        }
        for table in tables {
            if let Some(readers) = self.shared.get_mut(table) {
                readers.remove(&session);
                if readers.is_empty() {
                    self.shared.remove(table);
                }
            }
        }
        released
    }

    fn unlock(&mut self, session: SessionId, table: TableId, mode: LockMode) {
        match mode {
            LockMode::Exclusive => {
                if self.exclusive.get(&table) == Some(&session) {
                    self.exclusive.remove(&table);
                }
            }
            LockMode::Shared => {
                if let Some(readers) = self.shared.get_mut(&table) {
                    readers.remove(&session);
                    if readers.is_empty() {
                        self.shared.remove(&table);
                    }
                }
            }
        }
    }

    /// Walk the whole queue in registration order and grant every waiter
    /// whose request no longer conflicts with a holder or an earlier waiter.
    ///
    /// Returns the sessions granted, in the order they were served. Waiters
    /// left in the queue need no update: their wait-for sets are derived from
    /// the holders and queue as they are now.
    pub fn promote_waiters(&mut self) -> Vec<SessionId> {
        let queued: Vec<u64> = self.waiters.keys().copied().collect();
        let mut granted = Vec::new();
        for seq in queued {
            let (session, request, barging) = match self.waiters.get(&seq) {
                Some(w) => (w.session, w.request.clone(), w.barging),
                None => continue,
            };
            if !self.conflicting_holders(session, &request).is_empty() {
                continue;
            }
            if !barging && !self.queued_ahead(session, &request, Some(seq)).is_empty() {
                continue;
            }
            self.cancel_wait(session);
            self.grant(session, &request);
            granted.push(session);
        }
        granted
    }
}
