//! Blocking synchronization primitives used by the worker pool.
//!
//! `std` already provides the scoped mutex and the condition variable; this
//! module adds the missing counting semaphore and a lock helper that
//! survives poisoning. A worker that panics while holding a lock must not
//! take the whole queue down with it, so every lock in the crate goes
//! through [`lock`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct State {
    permits: usize,
    closed: bool,
}

/// Counting semaphore built from a mutex and a condition variable.
///
/// A semaphore can be closed. Closing wakes every waiter; acquisitions keep
/// succeeding while permits remain and fail once they run out, which lets
/// consumers drain outstanding work before exiting.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it.
    ///
    /// Returns `false` if the semaphore is closed and no permit is left.
    pub fn acquire(&self) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.permits > 0 {
                state.permits -= 1;
                return true;
            }
            if state.closed {
                return false;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take a permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut state = lock(&self.state);
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut state = lock(&self.state);
        state.permits += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Wake all waiters; see the type-level docs for the semantics.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }
}
