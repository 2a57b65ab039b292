//! Start and stop arbitration between the client and the capture core.
//!
//! A waiter answers two questions: which options the next capture runs with,
//! and why the running capture should stop. The stream flavour reads them
//! from the client's request stream; the in-process flavour is driven by
//! the hosting program itself.

use crate::stop_slot::StopSlot;
use crate::transport::CaptureRequestReader;
use log::{debug, info};
use orbit_protos::CaptureOptions;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

/// Why a capture was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopCaptureReason {
    /// The client asked for it, or closed its side of the stream
    ClientStop,
    /// The service's own memory exceeded the watchdog threshold
    MemoryWatchdog,
    /// The capture ran for its configured maximum duration
    ExceededMaxDurationLimit,
    GuestOrcStop,
    GuestOrcConnectionFailure,
    UploadFailure,
    Unknown,
}

impl fmt::Display for StopCaptureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientStop => "client stop",
            Self::MemoryWatchdog => "memory watchdog",
            Self::ExceededMaxDurationLimit => "exceeded max duration limit",
            Self::GuestOrcStop => "guest orchestrator stop",
            Self::GuestOrcConnectionFailure => "guest orchestrator connection failure",
            Self::UploadFailure => "upload failure",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Blocks until a capture should start, then until it should stop.
pub trait StopCaptureRequestWaiter: Send + Sync {
    /// Options of the capture to run, or `None` if the requester went away
    /// before asking for one.
    fn wait_for_start_capture_request(&self) -> Option<CaptureOptions>;

    fn wait_for_stop_capture_request(&self) -> StopCaptureReason;
}

// ============================================================================
// Stream waiter
// ============================================================================

/// Waiter reading from the client's request stream.
///
/// The first request carries the options. Any further request, or the client
/// finishing its writes, is a stop.
pub struct StreamStopCaptureRequestWaiter {
    reader: Mutex<Box<dyn CaptureRequestReader>>,
}

impl StreamStopCaptureRequestWaiter {
    #[must_use]
    pub fn new(reader: Box<dyn CaptureRequestReader>) -> Self {
        Self { reader: Mutex::new(reader) }
    }
}

impl StopCaptureRequestWaiter for StreamStopCaptureRequestWaiter {
    fn wait_for_start_capture_request(&self) -> Option<CaptureOptions> {
        let request = self.reader.lock().unwrap_or_else(PoisonError::into_inner).read()?;
        info!("Read CaptureRequest from Capture's gRPC stream: starting capture");
        Some(request.capture_options)
    }

    fn wait_for_stop_capture_request(&self) -> StopCaptureReason {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        // Draining until the client is done keeps the stream usable for it.
        while reader.read().is_some() {
            debug!("Ignoring additional CaptureRequest on Capture's gRPC stream");
        }
        StopCaptureReason::ClientStop
    }
}

// ============================================================================
// In-process waiter
// ============================================================================

/// Waiter driven by calls from the hosting program.
///
/// [`start_capture`](Self::start_capture) hands over the options and
/// [`stop_capture`](Self::stop_capture) ends the capture. If the options carry
/// a maximum duration, the capture stops with
/// [`StopCaptureReason::ExceededMaxDurationLimit`] once it elapses, unless an
/// earlier stop got there first.
#[derive(Default)]
pub struct InProcessStopCaptureRequestWaiter {
    start: Mutex<StartState>,
    started: Condvar,
    stop: StopSlot<StopCaptureReason>,
}

#[derive(Default)]
struct StartState {
    options: Option<CaptureOptions>,
    cancelled: bool,
}

impl InProcessStopCaptureRequestWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the options of the capture to the waiting service.
    pub fn start_capture(&self, options: CaptureOptions) {
        let mut start = self.start.lock().unwrap_or_else(PoisonError::into_inner);
        start.options = Some(options);
        self.started.notify_all();
    }

    /// Stop the running capture. Only the first stop counts.
    pub fn stop_capture(&self, reason: StopCaptureReason) {
        if !self.stop.request_stop(reason) {
            debug!("Ignoring stop request ({reason}): capture already stopping");
        }
        // A stop before the start means there will be no capture.
        let mut start = self.start.lock().unwrap_or_else(PoisonError::into_inner);
        start.cancelled = true;
        self.started.notify_all();
    }
}

impl StopCaptureRequestWaiter for InProcessStopCaptureRequestWaiter {
    fn wait_for_start_capture_request(&self) -> Option<CaptureOptions> {
        let start = self.start.lock().unwrap_or_else(PoisonError::into_inner);
        let start = self
            .started
            .wait_while(start, |s| s.options.is_none() && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        start.options.clone()
    }

    fn wait_for_stop_capture_request(&self) -> StopCaptureReason {
        let max_duration = self
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .options
            .as_ref()
            .and_then(CaptureOptions::max_capture_duration);
        if let Some(max_duration) = max_duration {
            if !self.stop.wait_timeout(max_duration)
                && self.stop.request_stop(StopCaptureReason::ExceededMaxDurationLimit)
            {
                info!("Capture reached its maximum duration of {max_duration:?}: stopping capture");
            }
        }
        self.stop.wait()
    }
}
