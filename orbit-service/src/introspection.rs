//! Self-instrumentation of the service.
//!
//! While an [`IntrospectionListener`] is alive, [`scope`] guards report their
//! begin and end as API events to the listener's callback. Without a
//! listener the guards do nothing.
//!
//! ```text
//! let _scope = introspection::scope("FinalizeEventProcessing");
//!   ├─ ApiScopeStart { name, tid, timestamp }   on creation
//!   └─ ApiScopeStop  { tid, timestamp }         on drop
//! ```

#![allow(unsafe_code)] // gettid() requires unsafe

use crate::clock;
use log::warn;
use orbit_protos::{ApiEvent, ApiScopeStart, ApiScopeStop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type ApiEventCallback = dyn Fn(ApiEvent) + Send + Sync;

struct InstalledListener {
    id: u64,
    callback: Arc<ApiEventCallback>,
}

static LISTENER: Mutex<Option<InstalledListener>> = Mutex::new(None);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn installed_callback() -> Option<Arc<ApiEventCallback>> {
    LISTENER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|l| Arc::clone(&l.callback))
}

fn current_tid() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::gettid() };
    u32::try_from(tid).unwrap_or_default()
}

/// Process-wide receiver of introspection events.
///
/// At most one listener is active; installing a new one replaces the old,
/// and dropping a listener only uninstalls it if it is still the active one.
pub struct IntrospectionListener {
    id: u64,
}

impl IntrospectionListener {
    pub fn new(callback: impl Fn(ApiEvent) + Send + Sync + 'static) -> Self {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let previous = LISTENER
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(InstalledListener { id, callback: Arc::new(callback) });
        if previous.is_some() {
            warn!("Replacing an active introspection listener");
        }
        Self { id }
    }
}

impl Drop for IntrospectionListener {
    fn drop(&mut self) {
        let mut listener = LISTENER.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|l| l.id == self.id) {
            *listener = None;
        }
    }
}

/// Guard emitting a scope start now and the matching stop when dropped.
#[must_use = "the scope ends when the guard is dropped"]
pub struct IntrospectionScope {
    callback: Option<Arc<ApiEventCallback>>,
    tid: u32,
}

/// Open a named introspection scope on the calling thread.
pub fn scope(name: &str) -> IntrospectionScope {
    let Some(callback) = installed_callback() else {
        return IntrospectionScope { callback: None, tid: 0 };
    };
    let tid = current_tid();
    callback(ApiEvent::ScopeStart(ApiScopeStart {
        pid: std::process::id(),
        tid,
        timestamp_ns: clock::now_ns(),
        name: name.to_string(),
        color_rgba: 0,
        group_id: 0,
        address_in_function: 0,
    }));
    IntrospectionScope { callback: Some(callback), tid }
}

impl Drop for IntrospectionScope {
    fn drop(&mut self) {
        // The stop goes to the listener that saw the start, even if it was replaced since.
        if let Some(callback) = self.callback.take() {
            callback(ApiEvent::ScopeStop(ApiScopeStop {
                pid: std::process::id(),
                tid: self.tid,
                timestamp_ns: clock::now_ns(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The listener is process-wide; serialize the tests touching it.
    static SERIAL: Mutex<()> = Mutex::new(());

    /// Records the events of the calling thread only; other tests may open scopes concurrently.
    fn recording_listener() -> (IntrospectionListener, Arc<Mutex<Vec<ApiEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let tid = current_tid();
        let listener = IntrospectionListener::new(move |e| {
            let event_tid = match &e {
                ApiEvent::ScopeStart(s) => s.tid,
                ApiEvent::ScopeStop(s) => s.tid,
                _ => return,
            };
            if event_tid == tid {
                sink.lock().unwrap().push(e);
            }
        });
        (listener, events)
    }

    #[test]
    fn test_scope_without_listener_is_silent() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = scope("nothing");
        assert!(guard.callback.is_none());
    }

    #[test]
    fn test_scope_emits_start_and_stop() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let (listener, events) = recording_listener();
        {
            let _scope = scope("work");
        }
        drop(listener);
        {
            let _after = scope("ignored");
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        let ApiEvent::ScopeStart(start) = &events[0] else { panic!("expected scope start") };
        let ApiEvent::ScopeStop(stop) = &events[1] else { panic!("expected scope stop") };
        assert_eq!(start.name, "work");
        assert_eq!(start.pid, std::process::id());
        assert_eq!(start.tid, stop.tid);
        assert!(start.timestamp_ns <= stop.timestamp_ns);
    }

    #[test]
    fn test_dropping_replaced_listener_keeps_new_one() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let (old, old_events) = recording_listener();
        let (new, new_events) = recording_listener();
        drop(old);
        {
            let _scope = scope("x");
        }
        drop(new);
        assert!(old_events.lock().unwrap().is_empty());
        assert_eq!(new_events.lock().unwrap().len(), 2);
    }
}
