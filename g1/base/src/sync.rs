use std::sync::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::time::Duration;

// TODO: I am not sure what we should do when a mutex is poisoned.  For now, we just crash.
// Should I ignore it like `tokio`?
pub trait MutexExt<T> {
    fn must_lock(&self) -> MutexGuard<'_, T>;
}

pub trait CondvarExt {
    fn must_wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;

    fn must_wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult);
}

impl<T> MutexExt<T> for Mutex<T> {
    fn must_lock(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap()
    }
}

impl CondvarExt for Condvar {
    fn must_wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(guard).unwrap()
    }

    fn must_wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_timeout(guard, timeout).unwrap()
    }
}
