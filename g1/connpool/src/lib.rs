//! Pool of expensive-to-create resources, such as outbound connections.
//!
//! A `Pool` creates resources on demand with a caller-supplied connect function, hands idle ones
//! out most-recently-returned first, caps the number of checked-out resources, and disconnects
//! resources that sit idle for too long or come back broken.
//!
//! Resources are not returned on drop; the caller must `release` them explicitly, after marking
//! them broken if they should not be reused.

pub mod clock;
pub mod cond;
pub mod error;

#[cfg(feature = "param")]
pub mod param;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use scopeguard::ScopeGuard;

use g1_base::sync::MutexExt;

use crate::clock::Clock;
use crate::cond::Condition;

pub use crate::error::Error;

/// Identifier assigned by the connect function.  The pool only passes it back to the disconnect
/// function.
pub type Id = u64;

pub type Connect<T, E> = dyn Fn() -> Result<(T, Id), E> + Send + Sync;
pub type Disconnect<T> = dyn Fn(T, Id) + Send + Sync;

/// What `acquire` does when the pool is at its `max_active` limit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wait {
    Forever,
    /// Wait for a release at most once per `acquire` call.
    Timeout(Duration),
    /// Return `Ok(None)` immediately.
    Never,
}

#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "param",
    derive(serde::Deserialize),
    serde(default, deny_unknown_fields)
)]
pub struct PoolBuilder {
    max_active: usize,
    reserved_idle: usize,
    #[cfg_attr(feature = "param", serde(deserialize_with = "param::duration"))]
    idle_timeout: Duration,
    wait: Wait,
    #[cfg_attr(feature = "param", serde(skip, default = "clock::system"))]
    clock: Arc<dyn Clock>,
}

pub struct Pool<T, E> {
    pool_id: u64,

    state: Mutex<State<T>>,
    // Constructed on the first wait; before that, there is nobody to signal.
    cond: OnceLock<Condition>,

    max_active: usize,
    reserved_idle: usize,
    idle_timeout: Duration,
    wait: Wait,
    clock: Arc<dyn Clock>,

    // We use `Box<dyn ...>` so that the function types do not leak into the generic parameters of
    // `Pool`.  `disconnect` is shared with the reaper thread.
    connect: Box<Connect<T, E>>,
    disconnect: Arc<Disconnect<T>>,
    reaper: Mutex<Option<Sender<Doomed<T>>>>,
}

struct State<T> {
    // Front is the most recently returned.
    idle: VecDeque<Pooled<T>>,
    active: usize,
    waiting: usize,
    closed: bool,
}

type Doomed<T> = (T, Id);

/// Resource checked out of a `Pool`.
#[derive(Debug)]
pub struct Pooled<T> {
    resource: T,
    id: Id,
    pool_id: u64,
    broken: bool,
    returned_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            max_active: 0,
            reserved_idle: 0,
            idle_timeout: Duration::ZERO,
            wait: Wait::Forever,
            clock: clock::system(),
        }
    }

    /// Zero means no limit.
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Number of idle resources that are never disconnected for being idle.
    pub fn reserved_idle(mut self, reserved_idle: usize) -> Self {
        self.reserved_idle = reserved_idle;
        self
    }

    /// Zero disables idle timeout.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build<T, E, C, D>(self, connect: C, disconnect: D) -> Pool<T, E>
    where
        C: Fn() -> Result<(T, Id), E> + Send + Sync + 'static,
        D: Fn(T, Id) + Send + Sync + 'static,
    {
        Pool {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),

            state: Mutex::new(State {
                idle: VecDeque::new(),
                active: 0,
                waiting: 0,
                closed: false,
            }),
            cond: OnceLock::new(),

            max_active: self.max_active,
            reserved_idle: self.reserved_idle,
            idle_timeout: self.idle_timeout,
            wait: self.wait,
            clock: self.clock,

            connect: Box::new(connect),
            disconnect: Arc::new(disconnect),
            reaper: Mutex::new(None),
        }
    }
}

impl<T, E> fmt::Debug for Pool<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("pool_id", &self.pool_id)
            .field("max_active", &self.max_active)
            .field("reserved_idle", &self.reserved_idle)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait", &self.wait)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<T, E> Pool<T, E> {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    pub fn active_count(&self) -> usize {
        self.state.must_lock().active
    }

    pub fn idle_count(&self) -> usize {
        self.state.must_lock().idle.len()
    }

    pub fn wait_count(&self) -> usize {
        self.state.must_lock().waiting
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.must_lock();
        Stats {
            active: state.active,
            idle: state.idle.len(),
            waiting: state.waiting,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.must_lock().closed
    }

    fn notify(&self) {
        if let Some(cond) = self.cond.get() {
            cond.signal();
        }
    }
}

impl<T, E> Pool<T, E>
where
    T: Send + 'static,
    E: std::error::Error + 'static,
{
    /// Checks out a resource, reusing an idle one if there is any.
    ///
    /// It returns `Ok(None)` when the pool is at its `max_active` limit and the wait policy is
    /// `Wait::Never`.
    pub fn acquire(&self) -> Result<Option<Pooled<T>>, Error<E>> {
        let mut timed_wait = false;
        let mut state = self.state.must_lock();
        loop {
            let evicted = state.evict(self.reserved_idle, self.idle_timeout, self.clock.now());
            if !evicted.is_empty() {
                drop(state);
                self.teardown_all(evicted);
                state = self.state.must_lock();
            }

            if let Some(pooled) = state.idle.pop_front() {
                state.active += 1;
                tracing::trace!(id = pooled.id, "reuse");
                return Ok(Some(pooled));
            }

            if state.closed {
                return Err(Error::Closed);
            }

            if self.max_active == 0 || state.active < self.max_active {
                state.active += 1;
                drop(state);
                return self.create().map(Some);
            }

            let timeout = match self.wait {
                Wait::Forever => None,
                Wait::Timeout(timeout) => {
                    // A caller that lost the race for a released resource does not get to wait
                    // again.
                    if timed_wait {
                        tracing::debug!(?timeout, "acquire timeout");
                        return Err(Error::Timeout { timeout });
                    }
                    timed_wait = true;
                    Some(timeout)
                }
                Wait::Never => return Ok(None),
            };
            state = self.wait_for_release(state, timeout);
        }
    }

    /// Returns a resource to the pool.
    ///
    /// A resource that is marked broken, or that is released after the pool is closed, is
    /// disconnected instead of being kept idle.
    pub fn release(&self, mut pooled: Pooled<T>) -> Result<(), Error<E>> {
        if pooled.pool_id != self.pool_id {
            tracing::warn!(
                id = pooled.id,
                pool_id = pooled.pool_id,
                "release resource of another pool",
            );
            return Err(Error::InvalidRelease { id: pooled.id });
        }

        let mut state = self.state.must_lock();
        state.active -= 1;
        if pooled.broken || state.closed {
            drop(state);
            if pooled.broken {
                tracing::warn!(id = pooled.id, "drop broken resource");
            }
            self.notify();
            self.teardown(pooled);
            return Ok(());
        }

        pooled.returned_at = Some(self.clock.now());
        tracing::trace!(id = pooled.id, "release");
        state.idle.push_front(pooled);
        self.notify();
        Ok(())
    }

    /// Closes the pool.
    ///
    /// Idle resources are disconnected, and blocked `acquire` calls are woken up to fail with
    /// `Error::Closed`.  Checked-out resources are disconnected when they are released.
    pub fn close(&self) {
        let mut state = self.state.must_lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = mem::take(&mut state.idle);
        let num_woken = self.cond.get().map_or(0, Condition::broadcast);
        drop(state);
        tracing::debug!(num_idle = idle.len(), num_woken, "close");
        self.teardown_all(idle);
    }

    fn create(&self) -> Result<Pooled<T>, Error<E>> {
        // Roll back the `active` increment unless `connect` succeeds (even if it panics), and let
        // a waiter have the freed slot.
        let rollback = scopeguard::guard((), |()| {
            self.state.must_lock().active -= 1;
            self.notify();
        });
        let (resource, id) = (self.connect)().map_err(|source| {
            tracing::warn!(error = %source, "connect");
            Error::Create { source }
        })?;
        ScopeGuard::into_inner(rollback);
        tracing::debug!(id, "create");
        Ok(Pooled::new(resource, id, self.pool_id))
    }

    fn wait_for_release<'a>(
        &'a self,
        mut state: MutexGuard<'a, State<T>>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, State<T>> {
        let cond = self.cond.get_or_init(Condition::new);
        state.waiting += 1;
        tracing::trace!(waiting = state.waiting, ?timeout, "wait");
        let mut state = match timeout {
            Some(timeout) => {
                let (state, signaled) = cond.wait_timeout(&self.state, state, timeout);
                tracing::trace!(signaled, "wake");
                state
            }
            None => cond.wait(&self.state, state),
        };
        state.waiting -= 1;
        state
    }

    fn teardown_all<I>(&self, doomed: I)
    where
        I: IntoIterator<Item = Pooled<T>>,
    {
        for pooled in doomed {
            self.teardown(pooled);
        }
    }

    // The caller must not hold the state lock.
    fn teardown(&self, pooled: Pooled<T>) {
        let doomed = pooled.into_parts();
        let mut reaper = self.reaper.must_lock();
        if reaper.is_none() {
            match self.spawn_reaper() {
                Ok(send) => *reaper = Some(send),
                Err(error) => tracing::warn!(%error, "spawn reaper"),
            }
        }
        let result = match reaper.as_ref() {
            Some(send) => send.send(doomed).map_err(|mpsc::SendError(doomed)| doomed),
            None => Err(doomed),
        };
        let Err((resource, id)) = result else {
            return;
        };
        // The reaper is gone (or could not be spawned); respawn it next time, and disconnect on
        // the caller's thread for now.
        *reaper = None;
        drop(reaper);
        tracing::debug!(id, "disconnect inline");
        (self.disconnect)(resource, id);
    }

    fn spawn_reaper(&self) -> Result<Sender<Doomed<T>>, io::Error> {
        let (send, recv) = mpsc::channel::<Doomed<T>>();
        let disconnect = self.disconnect.clone();
        thread::Builder::new()
            .name("connpool-reaper".to_string())
            .spawn(move || {
                // A panicking disconnect must not take down the reaper, or the teardowns queued
                // behind it would be dropped without a disconnect call.
                for (resource, id) in recv {
                    tracing::debug!(id, "disconnect");
                    let result = panic::catch_unwind(AssertUnwindSafe(|| disconnect(resource, id)));
                    if result.is_err() {
                        tracing::warn!(id, "disconnect panicked");
                    }
                }
            })?;
        Ok(send)
    }
}

impl<T, E> Drop for Pool<T, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for pooled in mem::take(&mut state.idle) {
            let (resource, id) = pooled.into_parts();
            (self.disconnect)(resource, id);
        }
        // Dropping the sender lets the reaper finish what is queued and exit.
    }
}

impl<T> State<T> {
    /// Removes idle resources that have been idle for longer than `idle_timeout`, oldest first,
    /// but never below `reserved_idle`.
    fn evict(
        &mut self,
        reserved_idle: usize,
        idle_timeout: Duration,
        now: Instant,
    ) -> Vec<Pooled<T>> {
        let mut evicted = Vec::new();
        if idle_timeout.is_zero() {
            return evicted;
        }
        while self.idle.len() > reserved_idle {
            let Some(oldest) = self.idle.back() else {
                break;
            };
            if !oldest.is_expired(now, idle_timeout) {
                break;
            }
            evicted.extend(self.idle.pop_back());
        }
        for pooled in &evicted {
            tracing::debug!(id = pooled.id, ?idle_timeout, "evict");
        }
        evicted
    }
}

impl<T> Pooled<T> {
    fn new(resource: T, id: Id, pool_id: u64) -> Self {
        Self {
            resource,
            id,
            pool_id,
            broken: false,
            returned_at: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Marks the resource broken, so that `release` disconnects it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// When the resource was last released; `None` if it has never been.
    pub fn returned_at(&self) -> Option<Instant> {
        self.returned_at
    }

    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.returned_at
            .is_some_and(|returned_at| now.saturating_duration_since(returned_at) > idle_timeout)
    }

    fn into_parts(self) -> Doomed<T> {
        (self.resource, self.id)
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.resource
    }
}
