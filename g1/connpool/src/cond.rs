//! Condition variable that supports bounded waits and drops signals nobody is waiting for.
//!
//! A `Condition` is used like `std::sync::Condvar`, except that it is not tied to a guard type:
//! the wait functions take both the associated mutex and a guard of it, release the guard while
//! blocked, and re-lock the mutex before returning.
//!
//! A signal is a rendezvous: it is delivered only if some thread is blocked in a wait function at
//! the instant of the call, and it is consumed by exactly one such thread.  It is never queued for
//! a future waiter.  Consequently, callers must re-check their predicate after every wakeup.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use g1_base::sync::{CondvarExt, MutexExt};

#[derive(Debug, Default)]
pub struct Condition {
    slots: Mutex<Slots>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct Slots {
    // Number of threads currently blocked in a wait function.
    waiting: usize,
    // Number of delivered but not-yet-consumed signals.
    //
    // Invariant: `signaled <= waiting`.  A signal is delivered only to a waiter that is not
    // already covered by an outstanding signal, and a waiter leaves on timeout only when there is
    // no outstanding signal.
    signaled: usize,
}

impl Slots {
    fn consume(&mut self) {
        self.signaled -= 1;
        self.waiting -= 1;
    }
}

impl Condition {
    pub fn new() -> Self {
        Default::default()
    }

    /// Blocks until a signal arrives.
    ///
    /// `guard` must be a guard of `mutex`.
    pub fn wait<'a, T>(&self, mutex: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mut slots = self.enter(guard);
        while slots.signaled == 0 {
            slots = self.cond.must_wait(slots);
        }
        slots.consume();
        drop(slots);
        mutex.must_lock()
    }

    /// Blocks until a signal arrives or `timeout` elapses, and returns true if it was signaled.
    ///
    /// When the timeout races with a signal, the signal wins: a waiter that observes an
    /// outstanding signal consumes it even if its deadline has passed, so no signal is left behind
    /// for a later, unrelated wait.
    pub fn wait_timeout<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return (self.wait(mutex, guard), true);
        };
        let mut slots = self.enter(guard);
        let signaled = loop {
            if slots.signaled > 0 {
                slots.consume();
                break true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                slots.waiting -= 1;
                break false;
            }
            slots = self.cond.must_wait_timeout(slots, remaining).0;
        };
        drop(slots);
        (mutex.must_lock(), signaled)
    }

    /// Wakes one blocked waiter, if any, and returns whether a waiter was there to be woken.
    pub fn signal(&self) -> bool {
        let mut slots = self.slots.must_lock();
        if slots.waiting == slots.signaled {
            return false;
        }
        slots.signaled += 1;
        drop(slots);
        self.cond.notify_one();
        true
    }

    /// Wakes every currently blocked waiter and returns how many were woken.
    pub fn broadcast(&self) -> usize {
        let mut num_woken = 0;
        while self.signal() {
            num_woken += 1;
        }
        num_woken
    }

    // Registers the caller as a waiter before releasing `guard`, so that a signal sent by whoever
    // acquires the mutex next cannot be missed.
    fn enter<T>(&self, guard: MutexGuard<'_, T>) -> MutexGuard<'_, Slots> {
        let mut slots = self.slots.must_lock();
        slots.waiting += 1;
        drop(guard);
        slots
    }
}
