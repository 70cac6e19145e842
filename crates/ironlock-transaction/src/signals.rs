//! Blocking and cooperative cancellation of a waiting session
//!
//! A session blocked on table locks parks on its `WaitLatch`. The session
//! that releases the locks counts the latch down; the coordinator can also
//! raise the abort signal, which wakes the waiter with `Cancelled` instead of
//! letting it observe a flag after the fact.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How a wait on the latch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The latch reached zero
    Released,
    /// The abort signal was raised
    Cancelled,
    /// The timeout elapsed first
    TimedOut,
}

/// Countable latch a session blocks on while waiting for locks
#[derive(Debug, Default)]
pub struct WaitLatch {
    count: Mutex<u64>,
    released: Condvar,
}

impl WaitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self, count: u64) {
        *self.count.lock() = count;
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Decrement the count, waking waiters when it reaches zero
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.released.notify_all();
        }
    }

    /// Drop the count to zero
    pub fn release(&self) {
        *self.count.lock() = 0;
        self.released.notify_all();
    }

    fn interrupt(&self) {
        // Taking the lock orders the wakeup after any in-progress check
        let _count = self.count.lock();
        self.released.notify_all();
    }

    /// Block until the count is zero, `abort` is raised or `timeout` elapses
    pub fn wait(&self, abort: &AtomicBool, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        loop {
            if abort.load(Ordering::SeqCst) {
                return WaitOutcome::Cancelled;
            }
            if *count == 0 {
                return WaitOutcome::Released;
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut count, deadline).timed_out() {
                        if abort.load(Ordering::SeqCst) {
                            return WaitOutcome::Cancelled;
                        }
                        if *count == 0 {
                            return WaitOutcome::Released;
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.released.wait(&mut count),
            }
        }
    }
}

/// Signals shared between a session and the coordinator
#[derive(Debug, Default)]
pub struct SessionSignals {
    abort_transaction: AtomicBool,
    redo_action: AtomicBool,
    latch: WaitLatch,
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to roll back at its next checkpoint, waking it if it waits
    pub fn raise_abort(&self) {
        self.abort_transaction.store(true, Ordering::SeqCst);
        self.latch.interrupt();
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_transaction.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.abort_transaction.store(false, Ordering::SeqCst);
    }

    /// Ask the session to undo and re-run its current statement
    pub fn request_redo(&self) {
        self.redo_action.store(true, Ordering::SeqCst);
    }

    /// Consume a pending redo request
    pub fn take_redo(&self) -> bool {
        self.redo_action.swap(false, Ordering::SeqCst)
    }

    pub fn latch(&self) -> &WaitLatch {
        &self.latch
    }

    /// Block until the locks this session waits for are granted
    pub fn wait_for_locks(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.latch.wait(&self.abort_transaction, timeout)
    }
}
