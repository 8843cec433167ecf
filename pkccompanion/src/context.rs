//! Shared run state of the companion service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Stop, suspend and state-change flags shared by every component.
///
/// Waits performed through the context (`sleep`, `wait_while_suspended`)
/// return early as soon as a stop is requested.
#[derive(Debug, Default)]
pub struct ServiceContext {
    stop: AtomicBool,
    suspended: Mutex<bool>,
    wake: Condvar,
    state_changed: AtomicBool,
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.suspended.lock();
        self.wake.notify_all();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        *self.suspended.lock() = true;
    }

    pub fn resume(&self) {
        *self.suspended.lock() = false;
        self.wake.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.lock()
    }

    /// Blocks while suspended. Returns `false` if a stop was requested.
    pub fn wait_while_suspended(&self) -> bool {
        let mut suspended = self.suspended.lock();
        loop {
            if self.should_stop() {
                return false;
            }
            if !*suspended {
                return true;
            }
            self.wake.wait_for(&mut suspended, Duration::from_millis(500));
        }
    }

    /// Sleeps for `duration`. Returns `false` if interrupted by a stop.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.suspended.lock();
        loop {
            if self.should_stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            self.wake.wait_for(&mut guard, deadline - now);
        }
    }

    pub fn mark_state_changed(&self) {
        self.state_changed.store(true, Ordering::SeqCst);
    }

    /// Returns and clears the state-changed flag.
    pub fn take_state_changed(&self) -> bool {
        self.state_changed.swap(false, Ordering::SeqCst)
    }
}
