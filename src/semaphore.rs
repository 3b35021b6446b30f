//! Counting semaphore carrying the last error code posted to it.
//!
//! Interrupt handlers only ever call the non-blocking `post*` family; callers
//! block in `wait`. The error slot is overwritten by every post, so a waiter
//! observes the outcome of the most recent hardware event.

use core::time::Duration;

use crate::errors::Result;
use crate::mutex::{Condvar, Mutex};

struct State {
    count: u32,
    error: Result<()>,
}

pub struct Semaphore {
    state: Mutex<State>,
    cvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` tokens. `0` is the locked state.
    pub const fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial,
                error: Ok(()),
            }),
            cvar: Condvar::new(),
        }
    }

    /// Adds one token and records `error` as the outcome. Never blocks for
    /// longer than the internal state update.
    pub fn post(&self, error: Result<()>) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_add(1);
        state.error = error;
        drop(state);

        self.cvar.notify_one();
    }

    /// Posts only while the token count is below `limit`, turning the
    /// semaphore into a binary one for periodic events. Returns whether a
    /// token was added.
    pub fn post_if_below(&self, limit: u32, error: Result<()>) -> bool {
        let mut state = self.state.lock();
        state.error = error;

        if state.count >= limit {
            return false;
        }

        state.count += 1;
        drop(state);

        self.cvar.notify_one();

        true
    }

    /// Blocks until a token is available, consumes it and returns the error
    /// recorded by the last post.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.count == 0 {
            state = self.cvar.wait(state);
        }

        state.count -= 1;
        state.error
    }

    /// Like `wait`, giving up after `timeout`. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.state.lock();
        while state.count == 0 {
            let (guard, timed_out) = self.cvar.wait_timeout(state, timeout);
            state = guard;
            if timed_out && state.count == 0 {
                return None;
            }
        }

        state.count -= 1;
        Some(state.error)
    }

    /// Consumes a token if one is available without blocking.
    pub fn try_wait(&self) -> Option<Result<()>> {
        let mut state = self.state.lock();
        if state.count == 0 {
            return None;
        }

        state.count -= 1;
        Some(state.error)
    }

    /// Forces the token count to `count`.
    pub fn reset(&self, count: u32) {
        let mut state = self.state.lock();
        state.count = count;
        state.error = Ok(());
    }

    pub fn value(&self) -> u32 {
        self.state.lock().count
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
