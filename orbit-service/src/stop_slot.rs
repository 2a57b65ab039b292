//! First-wins stop flag shared between the threads of a capture.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct StopState<R> {
    stop_requested: bool,
    reason: Option<R>,
}

/// Mutex-guarded `(stop_requested, reason)` pair with a condition variable.
///
/// The first [`request_stop`](Self::request_stop) sets the reason; later
/// requests only observe that a stop already happened.
#[derive(Debug)]
pub struct StopSlot<R> {
    state: Mutex<StopState<R>>,
    stopped: Condvar,
}

impl<R: Clone> StopSlot<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StopState { stop_requested: false, reason: None }),
            stopped: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StopState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a stop with `reason`. Returns true if this call was the first.
    pub fn request_stop(&self, reason: R) -> bool {
        let mut state = self.lock();
        if state.stop_requested {
            return false;
        }
        state.stop_requested = true;
        state.reason = Some(reason);
        self.stopped.notify_all();
        true
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// The winning reason, once a stop was requested.
    #[must_use]
    pub fn reason(&self) -> Option<R> {
        self.lock().reason.clone()
    }

    /// Wait up to `timeout` for a stop. Returns true if a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .stopped
            .wait_timeout_while(state, timeout, |s| !s.stop_requested)
            .unwrap_or_else(PoisonError::into_inner);
        state.stop_requested
    }

    /// Block until a stop is requested and return the winning reason.
    pub fn wait(&self) -> R {
        let mut state = self.lock();
        loop {
            if let Some(reason) = state.reason.clone() {
                return reason;
            }
            state = self.stopped.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<R: Clone> Default for StopSlot<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_request_wins() {
        let slot = StopSlot::new();
        assert!(slot.request_stop("first"));
        assert!(!slot.request_stop("second"));
        assert_eq!(slot.reason(), Some("first"));
        assert_eq!(slot.wait(), "first");
    }

    #[test]
    fn test_wait_timeout_without_stop() {
        let slot: StopSlot<u8> = StopSlot::new();
        assert!(!slot.wait_timeout(Duration::from_millis(10)));
        assert!(!slot.is_stop_requested());
    }

    #[test]
    fn test_wait_wakes_on_stop_from_other_thread() {
        let slot = Arc::new(StopSlot::new());
        let setter = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.request_stop(7);
        });
        assert_eq!(slot.wait(), 7);
        handle.join().unwrap();
    }
}
