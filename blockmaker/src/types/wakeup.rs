//! Blocking wait with an external nudge.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Lets mining threads sleep until the node reports a change.
///
/// Waiters also wake on a timeout, so a collaborator that never notifies
/// still gets polled.
#[derive(Debug, Default)]
pub struct Wakeup {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every thread currently waiting.
    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Block until notified or until `timeout` passes. Returns whether a
    /// notification arrived.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let seen = *generation;
        while *generation == seen {
            if self.changed.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}
