#![forbid(unsafe_code)]

use std::ops::Deref;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, VellumError};

/// Lock coordination consumed by the page storage.
///
/// Reads are shared, modify transactions are exclusive among themselves and
/// commits are exclusive among themselves. Readers only wait while the
/// storage drains them before closing. Every acquire honours the
/// implementation's timeout and fails with [`VellumError::Closed`] once
/// [`LockManager::shutdown`] has run, including for callers already waiting.
pub trait LockManager: Send + Sync {
    /// Acquires a shared read lock.
    fn lock_read(&self) -> Result<()>;
    /// Releases a shared read lock.
    fn unlock_read(&self);
    /// Acquires the exclusive modify lock.
    fn lock_modify(&self) -> Result<()>;
    /// Releases the exclusive modify lock.
    fn unlock_modify(&self);
    /// Acquires the exclusive commit lock.
    fn lock_commit(&self) -> Result<()>;
    /// Releases the exclusive commit lock.
    fn unlock_commit(&self);
    /// Refuses new readers and waits for active ones to finish.
    ///
    /// On timeout readers are admitted again and the call fails with
    /// [`VellumError::LockTimeout`]; on success they stay refused until
    /// [`LockManager::shutdown`].
    fn wait_readers_drained(&self) -> Result<()>;
    /// Wakes every waiter and refuses all future acquires.
    fn shutdown(&self);
    /// Returns a snapshot of the current lock state.
    fn snapshot(&self) -> LockSnapshot;
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of active readers.
    pub readers: u32,
    /// Whether the modify lock is held.
    pub modify: bool,
    /// Whether the commit lock is held.
    pub commit: bool,
    /// Whether new readers are held back for a close.
    pub draining: bool,
    /// Whether the manager has been shut down.
    pub closed: bool,
}

/// In-process [`LockManager`] with a single acquire timeout.
pub struct StorageLocks {
    state: Mutex<LockSnapshot>,
    released: Condvar,
    timeout: Duration,
}

impl StorageLocks {
    /// Creates a lock manager whose exclusive acquires give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockSnapshot::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    fn acquire_exclusive(
        &self,
        held: fn(&mut LockSnapshot) -> &mut bool,
        what: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VellumError::Closed);
            }
            let flag = held(&mut *state);
            if !*flag {
                *flag = true;
                return Ok(());
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Err(VellumError::Closed);
                }
                let flag = held(&mut *state);
                if !*flag {
                    *flag = true;
                    return Ok(());
                }
                return Err(VellumError::LockTimeout(what));
            }
        }
    }

    fn release_exclusive(&self, held: fn(&mut LockSnapshot) -> &mut bool) {
        let mut state = self.state.lock();
        *held(&mut *state) = false;
        drop(state);
        self.released.notify_all();
    }
}

impl LockManager for StorageLocks {
    fn lock_read(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VellumError::Closed);
            }
            if !state.draining {
                state.readers = state.readers.saturating_add(1);
                return Ok(());
            }
            if self.released.wait_until(&mut state, deadline).timed_out() && state.draining {
                return Err(if state.closed {
                    VellumError::Closed
                } else {
                    VellumError::LockTimeout("read")
                });
            }
        }
    }

    fn unlock_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.released.notify_all();
    }

    fn lock_modify(&self) -> Result<()> {
        self.acquire_exclusive(|s| &mut s.modify, "modify")
    }

    fn unlock_modify(&self) {
        self.release_exclusive(|s| &mut s.modify);
    }

    fn lock_commit(&self) -> Result<()> {
        self.acquire_exclusive(|s| &mut s.commit, "commit")
    }

    fn unlock_commit(&self) {
        self.release_exclusive(|s| &mut s.commit);
    }

    fn wait_readers_drained(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        state.draining = true;
        while state.readers > 0 && !state.closed {
            if self.released.wait_until(&mut state, deadline).timed_out() && state.readers > 0 {
                state.draining = false;
                drop(state);
                self.released.notify_all();
                return Err(VellumError::LockTimeout("readers"));
            }
        }
        if state.closed {
            return Err(VellumError::Closed);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.state.lock().closed = true;
        self.released.notify_all();
    }

    fn snapshot(&self) -> LockSnapshot {
        *self.state.lock()
    }
}

/// Bounded pool of lazily opened handles.
///
/// At most `max` handles exist at once; an acquire on an exhausted pool
/// blocks until a handle is returned or the pool is closed.
pub struct HandlePool<T> {
    state: Mutex<PoolState<T>>,
    returned: Condvar,
    max: usize,
}

struct PoolState<T> {
    idle: Vec<T>,
    created: usize,
    closed: bool,
}

impl<T> HandlePool<T> {
    /// Creates an empty pool that will open at most `max` handles.
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
                closed: false,
            }),
            returned: Condvar::new(),
            max: max.max(1),
        }
    }

    /// Takes an idle handle, opens a new one if below the limit, or waits.
    pub fn acquire<F>(&self, open: F) -> Result<PooledHandle<'_, T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VellumError::Closed);
            }
            if let Some(handle) = state.idle.pop() {
                return Ok(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                });
            }
            if state.created < self.max {
                state.created += 1;
                drop(state);
                return match open() {
                    Ok(handle) => Ok(PooledHandle {
                        pool: self,
                        handle: Some(handle),
                    }),
                    Err(err) => {
                        self.state.lock().created -= 1;
                        self.returned.notify_one();
                        Err(err)
                    }
                };
            }
            self.returned.wait(&mut state);
        }
    }

    /// Drops every idle handle and fails all current and future acquires.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.created -= state.idle.len();
        state.idle.clear();
        drop(state);
        self.returned.notify_all();
    }

    /// Number of handles opened and not yet discarded.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    fn give_back(&self, handle: T) {
        let mut state = self.state.lock();
        if state.closed {
            state.created -= 1;
        } else {
            state.idle.push(handle);
        }
        drop(state);
        self.returned.notify_one();
    }
}

/// A handle borrowed from a [`HandlePool`]; returned on drop.
pub struct PooledHandle<'a, T> {
    pool: &'a HandlePool<T>,
    handle: Option<T>,
}

impl<T> Deref for PooledHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("pooled handle present until drop")
    }
}

impl<T> Drop for PooledHandle<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle);
        }
    }
}
