//! IronLock Transaction - table-level two-phase locking
//!
//! The coordinator decides, for every statement of every session, whether it
//! may run now or has to wait for table locks, and makes the row actions of
//! a transaction durable on commit or undoes them on rollback.
//!
//! - `LogicalClock`: the global change timestamp
//! - `RowAction`: one pending insert or delete
//! - `SessionTxState`: the transactional state owned by a session
//! - `LockTable`: table lock holders and the wait-for relation
//! - `TwoPhaseLocking`: the coordinator, behind the `ConcurrencyControl` trait

pub mod clock;
pub mod control;
pub mod lock_table;
pub mod ownership;
pub mod row_action;
pub mod session_state;
pub mod signals;
pub mod two_phase;

pub use clock::LogicalClock;
pub use control::{build_coordinator, BeginAction, ClockHandoff, ConcurrencyControl};
pub use lock_table::{Acquire, LockMode, LockRequest, LockTable};
pub use ownership::RowOwnership;
pub use row_action::RowAction;
pub use session_state::{Savepoint, SessionTxState};
pub use signals::{SessionSignals, WaitLatch, WaitOutcome};
pub use two_phase::TwoPhaseLocking;
