//! Capture service state machine
//!
//! ```text
//!   Idle ──initialize──▶ Initializing ──start request──▶ Running
//!    ▲                        │ AlreadyInProgress            │ first stop trigger wins
//!    │                        ▼                              ▼
//!    └──────────── CaptureFinished + stop_and_wait ◀── Finalizing
//! ```
//!
//! [`CaptureServiceBase`] holds what every platform shares: the single-capture
//! guard, the start/stop listeners and the framing events. The platform
//! services own their producers and the start and finalize sequences:
//!
//! - [`LinuxCaptureService`]: API toggle, user-space instrumentation, kernel
//!   tracer, memory sampling, memory watchdog and minidump post-mortem
//! - [`WindowsCaptureService`]: tracer only

mod base;
mod linux;
mod windows;

pub use base::{
    create_capture_finished_event, create_capture_started_event, create_clock_resolution_event,
    create_error_enabling_orbit_api_event, create_error_enabling_user_space_instrumentation_event,
    create_warning_event, CaptureServiceBase, CaptureSession,
};
pub use linux::LinuxCaptureService;
pub use windows::WindowsCaptureService;

use crate::introspection::IntrospectionListener;
use crate::processor::ProducerEventProcessor;
use log::error;
use orbit_protos::{CaptureOptions, INTROSPECTION_PRODUCER_ID};
use std::sync::Arc;
use std::thread;

/// Component that runs alongside every capture, e.g. a producer connecting
/// from outside the service.
pub trait CaptureStartStopListener: Send + Sync {
    /// Called once the capture is running. Events go to `processor`.
    fn on_capture_start_requested(
        &self,
        options: &CaptureOptions,
        processor: Arc<dyn ProducerEventProcessor>,
    );

    /// Called during finalization, concurrently with the other listeners and
    /// the internal producers. Must return in bounded time.
    fn on_capture_stop_requested(&self);
}

/// Introspection listener routing the service's own scopes to `processor`.
fn create_introspection_listener(processor: Arc<dyn ProducerEventProcessor>) -> IntrospectionListener {
    IntrospectionListener::new(move |event| {
        processor.process_event(INTROSPECTION_PRODUCER_ID, event.into());
    })
}

/// Run `internal_stops` and every listener's stop on its own thread and join them all.
fn stop_in_parallel(
    internal_stops: &[&(dyn Fn() + Sync)],
    listeners: &[Arc<dyn CaptureStartStopListener>],
) {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(internal_stops.len() + listeners.len());
        for stop in internal_stops {
            handles.push(scope.spawn(move || stop()));
        }
        for listener in listeners {
            handles.push(scope.spawn(move || listener.on_capture_stop_requested()));
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("A producer panicked while stopping");
            }
        }
    });
}
