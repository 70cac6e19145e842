//! Multi-session behavior of the table-level locking coordinator

use ironlock::storage::{LogRecord, Logger, MemoryLogger, MemoryRowStore, PersistentStore, Row};
use ironlock::{
    Database, DatabaseConfig, DmlStatement, Error, Result, Session, StatementContext,
    StatementResult, TableId, Value,
};
use ironlock::common::{ActionType, RowPosition, SessionId, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Body = Box<dyn Fn(&mut StatementContext<'_>) -> Result<StatementResult> + Send>;

fn insert(table: TableId, v: i32) -> DmlStatement<Body> {
    DmlStatement::new(
        format!("INSERT INTO t{} VALUES ({})", table, v),
        Box::new(move |ctx: &mut StatementContext<'_>| {
            let position = ctx.insert(table, vec![Value::Integer(v)])?;
            Ok(StatementResult::rows(vec![vec![Value::BigInt(position as i64)]]))
        }) as Body,
    )
    .writes(&[table])
}

fn delete(table: TableId, position: RowPosition) -> DmlStatement<Body> {
    DmlStatement::new(
        format!("DELETE FROM t{} WHERE _pos = {}", table, position),
        Box::new(move |ctx: &mut StatementContext<'_>| {
            ctx.delete(table, position)?;
            Ok(StatementResult::updated(1))
        }) as Body,
    )
    .writes(&[table])
}

fn position_of(result: &StatementResult) -> RowPosition {
    result.rows[0][0].as_i64().unwrap() as RowPosition
}

fn manual_db() -> Database {
    Database::open(DatabaseConfig::default().with_autocommit(false)).unwrap()
}

fn manual_session(db: &Database) -> Session {
    let session = db.connect();
    assert!(!session.is_autocommit());
    session
}

fn snapshot(db: &Database, table: TableId) -> Vec<(RowPosition, Vec<Value>)> {
    db.table(table)
        .unwrap()
        .scan()
        .iter()
        .map(|row| (row.position, row.values.clone()))
        .collect()
}

fn wait_until_waiting(db: &Database, session: SessionId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !db.coordinator().waiting_sessions().contains(&session) {
        assert!(
            Instant::now() < deadline,
            "session {} never started waiting",
            session
        );
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_single_writer_per_table() {
    let db = Database::new();
    let t = db.create_table("t");
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let db = db.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            thread::spawn(move || {
                let mut session = db.connect();
                let stmt = DmlStatement::new("INSERT INTO t VALUES (?)", move |ctx| {
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    ctx.insert(t, vec![Value::Integer(worker)])?;
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(StatementResult::updated(1))
                })
                .writes(&[t]);
                for _ in 0..25 {
                    session.execute(&stmt).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(db.table(t).unwrap().row_count(), 100);
    assert!(db.coordinator().lock_holders(t).is_empty());
}

/// Logger whose commit record write can be made to fail
struct FailingLogger {
    inner: MemoryLogger,
    fail_commit: AtomicBool,
}

impl Logger for FailingLogger {
    fn write_to_log(&self, session: SessionId, sql: &str) -> Result<()> {
        self.inner.write_to_log(session, sql)
    }

    fn write_row_action(&self, session: SessionId, action: ActionType, row: &Row) -> Result<()> {
        self.inner.write_row_action(session, action, row)
    }

    fn write_commit(&self, session: SessionId, timestamp: Timestamp) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.write_commit(session, timestamp)
    }

    fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }
}

#[test]
fn test_failed_log_write_rolls_back_everything() {
    let logger = Arc::new(FailingLogger {
        inner: MemoryLogger::new(),
        fail_commit: AtomicBool::new(false),
    });
    let db = Database::with_logger(
        DatabaseConfig::default().with_autocommit(false),
        logger.clone() as Arc<dyn Logger>,
    )
    .unwrap();
    let t = db.create_table("t");
    let mut session = manual_session(&db);

    let kept = position_of(&session.execute(&insert(t, 1)).unwrap());
    session.commit().unwrap();
    let before = snapshot(&db, t);

    session.execute(&insert(t, 2)).unwrap();
    session.execute(&insert(t, 3)).unwrap();
    session.execute(&delete(t, kept)).unwrap();

    logger.fail_commit.store(true, Ordering::SeqCst);
    let err = session.commit().unwrap_err();
    assert!(matches!(err, Error::FatalStore(_)));

    assert_eq!(snapshot(&db, t), before);
    assert!(!session.is_in_transaction());
    assert_eq!(session.state().action_count(), 0);
    assert!(db.coordinator().lock_holders(t).is_empty());
    assert_eq!(db.coordinator().transaction_count(), 0);

    logger.fail_commit.store(false, Ordering::SeqCst);
    session.execute(&insert(t, 4)).unwrap();
    session.commit().unwrap();
    assert_eq!(db.table(t).unwrap().row_count(), 2);
}

#[test]
fn test_reused_savepoint_name_moves_it() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut session = manual_session(&db);

    session.savepoint("A").unwrap();
    session.execute(&insert(t, 1)).unwrap();
    session.execute(&insert(t, 2)).unwrap();
    session.savepoint("A").unwrap();

    let savepoints = session.state().savepoints();
    assert_eq!(savepoints.len(), 1);
    assert_eq!(savepoints[0].name, "A");
    assert_eq!(savepoints[0].log_length, 2);

    session.execute(&insert(t, 3)).unwrap();
    session.rollback_to_savepoint("A").unwrap();
    assert_eq!(db.table(t).unwrap().row_count(), 2);
}

#[test]
fn test_lock_successor_sees_later_timestamps() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut first = manual_session(&db);
    first.execute(&insert(t, 1)).unwrap();

    let second = manual_session(&db);
    let second_id = second.id();
    let handle = {
        thread::spawn(move || {
            let mut second = second;
            second.execute(&insert(t, 2)).unwrap();
            let observed = second.state().action_timestamp();
            second.commit().unwrap();
            observed
        })
    };

    wait_until_waiting(&db, second_id);
    first.commit().unwrap();
    let commit_ts = first.state().transaction_end_timestamp();

    let observed = handle.join().unwrap();
    assert!(commit_ts < observed);
}

#[test]
fn test_rollback_restores_visible_rows() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut session = manual_session(&db);

    let mut positions = Vec::new();
    for v in 1..=5 {
        positions.push(position_of(&session.execute(&insert(t, v)).unwrap()));
    }
    session.commit().unwrap();
    let before = snapshot(&db, t);

    session.execute(&delete(t, positions[1])).unwrap();
    let fresh = position_of(&session.execute(&insert(t, 10)).unwrap());
    session.execute(&insert(t, 11)).unwrap();
    session.execute(&delete(t, fresh)).unwrap();
    let update = DmlStatement::new("UPDATE t SET v = 30 WHERE v = 3", move |ctx| {
        ctx.update(t, positions[2], vec![Value::Integer(30)])?;
        Ok(StatementResult::updated(1))
    })
    .writes(&[t]);
    session.execute(&update).unwrap();
    let purge = DmlStatement::new("DELETE FROM t WHERE v > 3", move |ctx| {
        let count = ctx.delete_where(t, |row| row.values[0].as_i64().unwrap_or(0) > 3)?;
        Ok(StatementResult::updated(count))
    })
    .writes(&[t]);
    session.execute(&purge).unwrap();
    assert_ne!(snapshot(&db, t), before);

    session.rollback().unwrap();
    assert_eq!(snapshot(&db, t), before);
}

#[test]
fn test_delete_waits_for_inserting_session_commit() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut a = manual_session(&db);
    let r1 = position_of(&a.execute(&insert(t, 1)).unwrap());

    let b = manual_session(&db);
    let b_id = b.id();
    let handle = thread::spawn(move || {
        let mut b = b;
        let result = b.execute(&delete(t, r1));
        b.commit().unwrap();
        result
    });

    wait_until_waiting(&db, b_id);
    a.commit().unwrap();

    assert_eq!(handle.join().unwrap().unwrap().update_count, 1);
    assert_eq!(db.table(t).unwrap().row_count(), 0);
}

#[test]
fn test_delete_after_inserting_session_rollback() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut a = manual_session(&db);
    let r1 = position_of(&a.execute(&insert(t, 1)).unwrap());

    let b = manual_session(&db);
    let b_id = b.id();
    let handle = thread::spawn(move || {
        let mut b = b;
        b.execute(&delete(t, r1))
    });

    wait_until_waiting(&db, b_id);
    a.rollback().unwrap();

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::RowNotFound(position) if position == r1));
}

/// Memory store that records the value of every undone row
struct RecordingStore {
    inner: MemoryRowStore,
    undone: Arc<Mutex<Vec<i64>>>,
    fail_commit: bool,
}

impl PersistentStore for RecordingStore {
    fn table_id(&self) -> TableId {
        self.inner.table_id()
    }

    fn new_row(&self, values: Vec<Value>) -> Arc<Row> {
        self.inner.new_row(values)
    }

    fn get(&self, position: RowPosition) -> Option<Arc<Row>> {
        self.inner.get(position)
    }

    fn index_row(&self, row: Arc<Row>) -> Result<()> {
        self.inner.index_row(row)
    }

    fn delete(&self, row: &Row) -> Result<()> {
        self.inner.delete(row)
    }

    fn rollback_row(&self, row: Arc<Row>, action: ActionType) -> Result<()> {
        if let Some(v) = row.values[0].as_i64() {
            self.undone.lock().unwrap().push(v);
        }
        self.inner.rollback_row(row, action)
    }

    fn commit_row(&self, row: &Row, action: ActionType) -> Result<()> {
        if self.fail_commit {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "page write failed",
            )));
        }
        self.inner.commit_row(row, action)
    }

    fn scan(&self) -> Vec<Arc<Row>> {
        self.inner.scan()
    }

    fn row_count(&self) -> usize {
        self.inner.row_count()
    }
}

#[test]
fn test_savepoint_rollback_undoes_newest_first() {
    let db = manual_db();
    let undone = Arc::new(Mutex::new(Vec::new()));
    let recorder = undone.clone();
    let t = db.create_table_with("t", move |id, row_ids: Arc<AtomicU64>| {
        Arc::new(RecordingStore {
            inner: MemoryRowStore::new(id, row_ids),
            undone: recorder,
            fail_commit: false,
        }) as Arc<dyn PersistentStore>
    });
    let mut session = manual_session(&db);

    for v in 1..=3 {
        session.execute(&insert(t, v)).unwrap();
    }
    session.savepoint("sp1").unwrap();
    session.execute(&insert(t, 4)).unwrap();
    session.execute(&insert(t, 5)).unwrap();

    session.rollback_to_savepoint("sp1").unwrap();
    assert_eq!(session.state().action_count(), 3);
    assert_eq!(*undone.lock().unwrap(), vec![5, 4]);
    assert!(session.is_in_transaction());
    assert_eq!(session.state().savepoint_index("sp1"), Some(0));
}

#[test]
fn test_row_finalize_failure_still_ends_commit() {
    let logger = Arc::new(MemoryLogger::new());
    let db = Database::with_logger(
        DatabaseConfig::default().with_autocommit(false),
        logger.clone() as Arc<dyn Logger>,
    )
    .unwrap();
    let t = db.create_table_with("t", |id, row_ids: Arc<AtomicU64>| {
        Arc::new(RecordingStore {
            inner: MemoryRowStore::new(id, row_ids),
            undone: Arc::new(Mutex::new(Vec::new())),
            fail_commit: true,
        }) as Arc<dyn PersistentStore>
    });
    let mut session = manual_session(&db);
    session.execute(&insert(t, 1)).unwrap();

    let err = session.commit().unwrap_err();
    assert!(matches!(err, Error::FatalStore(_)));
    assert!(matches!(logger.records().last(), Some(LogRecord::Commit { .. })));
    assert!(!session.is_in_transaction());
    assert!(db.coordinator().lock_holders(t).is_empty());
    assert_eq!(db.coordinator().transaction_count(), 0);
    assert_eq!(db.table(t).unwrap().row_count(), 1);
}

#[test]
fn test_abort_signal_cancels_lock_wait() {
    let db = manual_db();
    let t = db.create_table("t");
    let own = db.create_table("own");
    let mut holder = manual_session(&db);
    holder.execute(&insert(t, 1)).unwrap();

    let mut waiter = manual_session(&db);
    waiter.execute(&insert(own, 1)).unwrap();
    let waiter_id = waiter.id();
    let signals = waiter.state().signals().clone();
    let handle = thread::spawn(move || {
        let result = waiter.execute(&insert(t, 2));
        (result, waiter)
    });
    wait_until_waiting(&db, waiter_id);

    signals.raise_abort();
    let (result, waiter) = handle.join().unwrap();
    assert!(matches!(result, Err(Error::SerializationFailure)));
    assert!(!waiter.is_in_transaction());
    assert_eq!(waiter.state().action_count(), 0);
    assert!(!signals.is_abort_requested());
    assert!(db.coordinator().waiting_sessions().is_empty());
    assert!(db.coordinator().lock_holders(own).is_empty());
    assert_eq!(db.table(own).unwrap().row_count(), 0);

    holder.commit().unwrap();
    assert_eq!(db.table(t).unwrap().row_count(), 1);
}

#[test]
fn test_commit_after_abort_signal_rolls_back() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut session = manual_session(&db);
    session.execute(&insert(t, 1)).unwrap();

    session.state().signals().raise_abort();
    let err = session.commit().unwrap_err();
    assert!(matches!(err, Error::SerializationFailure));
    assert_eq!(err.sql_state(), "40001");
    assert!(err.is_retryable());

    assert_eq!(session.state().action_count(), 0);
    assert!(!session.is_in_transaction());
    assert!(db.coordinator().lock_holders(t).is_empty());
    assert_eq!(db.table(t).unwrap().row_count(), 0);
}

#[test]
fn test_disjoint_tables_proceed_together() {
    let db = manual_db();
    let tables = [db.create_table("left"), db.create_table("right")];
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = tables
        .iter()
        .map(|&table| {
            let db = db.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut session = db.connect();
                session.execute(&insert(table, 1)).unwrap();
                // Both sessions hold their table lock here
                barrier.wait();
                session.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    for table in tables {
        assert_eq!(db.table(table).unwrap().row_count(), 1);
    }
}

#[test]
fn test_overlapping_tables_wait_for_commit() {
    let db = manual_db();
    let t = db.create_table("t");
    let mut first = manual_session(&db);
    first.execute(&insert(t, 1)).unwrap();

    let second = manual_session(&db);
    let second_id = second.id();
    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let done = done.clone();
        thread::spawn(move || {
            let mut second = second;
            second.execute(&insert(t, 2)).unwrap();
            done.store(true, Ordering::SeqCst);
            second.commit().unwrap();
        })
    };

    wait_until_waiting(&db, second_id);
    assert!(!done.load(Ordering::SeqCst));
    first.commit().unwrap();
    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(db.table(t).unwrap().row_count(), 2);
}

#[test]
fn test_wait_cycle_aborts_requester() {
    let db = manual_db();
    let t1 = db.create_table("t1");
    let t2 = db.create_table("t2");
    let mut a = manual_session(&db);
    let mut b = manual_session(&db);
    a.execute(&insert(t1, 1)).unwrap();
    b.execute(&insert(t2, 1)).unwrap();

    let both = move || {
        DmlStatement::new("INSERT INTO t1 SELECT * FROM t2", move |ctx| {
            ctx.insert(t1, vec![Value::Integer(2)])?;
            ctx.insert(t2, vec![Value::Integer(2)])?;
            Ok(StatementResult::updated(2))
        })
        .writes(&[t1, t2])
    };

    let a_id = a.id();
    let handle = thread::spawn(move || {
        let result = a.execute(&both());
        a.commit().unwrap();
        result
    });
    wait_until_waiting(&db, a_id);

    let err = b.execute(&both()).unwrap_err();
    assert!(matches!(err, Error::SerializationFailure));
    assert!(!b.is_in_transaction());

    assert_eq!(handle.join().unwrap().unwrap().update_count, 2);
    assert_eq!(db.table(t1).unwrap().row_count(), 2);
    assert_eq!(db.table(t2).unwrap().row_count(), 1);
}

#[test]
fn test_lock_wait_timeout() {
    let db = Database::open(
        DatabaseConfig::default()
            .with_autocommit(false)
            .with_lock_wait_timeout(Duration::from_millis(50)),
    )
    .unwrap();
    let t = db.create_table("t");
    let mut holder = manual_session(&db);
    holder.execute(&insert(t, 1)).unwrap();

    let mut waiter = manual_session(&db);
    let err = waiter.execute(&insert(t, 2)).unwrap_err();
    assert!(matches!(err, Error::LockWaitTimeout));
    assert!(db.coordinator().waiting_sessions().is_empty());
    assert!(!waiter.is_in_transaction());

    holder.commit().unwrap();
    waiter.execute(&insert(t, 2)).unwrap();
    waiter.commit().unwrap();
    assert_eq!(db.table(t).unwrap().row_count(), 2);
}

#[test]
fn test_readers_share_and_block_writers() {
    let db = Database::open(
        DatabaseConfig::default()
            .with_autocommit(false)
            .with_isolation(ironlock::IsolationLevel::RepeatableRead),
    )
    .unwrap();
    let t = db.create_table("t");
    let count = move || {
        DmlStatement::new("SELECT COUNT(*) FROM t", move |ctx| {
            let rows = ctx.scan(t)?;
            Ok(StatementResult::rows(vec![vec![Value::BigInt(rows.len() as i64)]]))
        })
        .reads(&[t])
    };

    let mut r1 = manual_session(&db);
    let mut r2 = manual_session(&db);
    r1.execute(&count()).unwrap();
    r2.execute(&count()).unwrap();
    assert_eq!(db.coordinator().lock_holders(t).len(), 2);

    let writer = manual_session(&db);
    let writer_id = writer.id();
    let handle = thread::spawn(move || {
        let mut writer = writer;
        writer.execute(&insert(t, 1)).unwrap();
        writer.commit().unwrap();
    });
    wait_until_waiting(&db, writer_id);

    r1.commit().unwrap();
    assert!(db.coordinator().waiting_sessions().contains(&writer_id));
    r2.commit().unwrap();
    handle.join().unwrap();
    assert_eq!(db.table(t).unwrap().row_count(), 1);
}

#[test]
fn test_commit_log_order() {
    let logger = Arc::new(MemoryLogger::new());
    let db = Database::with_logger(DatabaseConfig::default(), logger.clone() as Arc<dyn Logger>)
        .unwrap();
    let t = db.create_table("t");
    let mut session = db.connect();
    session.execute(&insert(t, 1)).unwrap();
    session.execute(&insert(t, 2)).unwrap();

    let timestamps: Vec<Timestamp> = logger
        .records()
        .iter()
        .filter_map(|record| match record {
            LogRecord::Commit { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(timestamps.len(), 2);
    assert!(timestamps[0] < timestamps[1]);
}
