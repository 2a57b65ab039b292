use super::CaptureStartStopListener;
use crate::clock;
use crate::collector::ClientCaptureEventCollector;
use crate::domain::{CaptureServiceError, Pid};
use crate::postmortem::TargetProcessStateAfterCapture;
use crate::process::{
    BuildIdQuery, ExecutablePathQuery, ObjectFileBuildIdQuery, ProcfsExecutablePathQuery,
};
use crate::processor::{InterningEventProcessor, ProducerEventProcessor};
use crate::stop_waiter::StopCaptureReason;
use log::{error, info, warn};
use orbit_protos::{
    CaptureFinished, CaptureOptions, CaptureStarted, CaptureStatus, ClockResolutionEvent,
    ErrorEnablingOrbitApiEvent, ErrorEnablingUserSpaceInstrumentationEvent, ProducerCaptureEvent,
    WarningEvent, EXTERNAL_PRODUCER_START_ID, ROOT_PRODUCER_ID,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// Framing events
// ============================================================================

fn version_component(component: &str) -> u32 {
    component.parse().unwrap_or_default()
}

/// `CaptureStarted` for `options`. Unresolvable executable data is left empty.
#[must_use]
pub fn create_capture_started_event(
    options: &CaptureOptions,
    capture_start_timestamp_ns: u64,
    executable_path_query: &dyn ExecutablePathQuery,
    build_id_query: &dyn BuildIdQuery,
) -> CaptureStarted {
    let pid = Pid(options.pid);
    let (executable_path, executable_build_id) = match executable_path_query.executable_path(pid)
    {
        Ok(path) => {
            let build_id = build_id_query.build_id_for(&path).unwrap_or_else(|e| {
                warn!("Unable to get build id of {}: {e}", path.display());
                String::new()
            });
            (path.to_string_lossy().into_owned(), build_id)
        }
        Err(e) => {
            error!("Unable to get executable path of {pid}: {e}");
            (String::new(), String::new())
        }
    };

    CaptureStarted {
        process_id: pid.0,
        executable_path,
        executable_build_id,
        capture_start_unix_time_ns: clock::unix_time_ns(),
        capture_start_timestamp_ns,
        orbit_version_major: version_component(env!("CARGO_PKG_VERSION_MAJOR")),
        orbit_version_minor: version_component(env!("CARGO_PKG_VERSION_MINOR")),
        capture_options: options.clone(),
    }
}

#[must_use]
pub fn create_clock_resolution_event(timestamp_ns: u64, resolution_ns: u64) -> ClockResolutionEvent {
    ClockResolutionEvent { timestamp_ns, clock_resolution_ns: resolution_ns }
}

#[must_use]
pub fn create_error_enabling_orbit_api_event(
    timestamp_ns: u64,
    message: String,
) -> ErrorEnablingOrbitApiEvent {
    ErrorEnablingOrbitApiEvent { timestamp_ns, message }
}

#[must_use]
pub fn create_error_enabling_user_space_instrumentation_event(
    timestamp_ns: u64,
    message: String,
) -> ErrorEnablingUserSpaceInstrumentationEvent {
    ErrorEnablingUserSpaceInstrumentationEvent { timestamp_ns, message }
}

#[must_use]
pub fn create_warning_event(timestamp_ns: u64, message: String) -> WarningEvent {
    WarningEvent { timestamp_ns, message }
}

/// `CaptureFinished` for a stop `reason` and the target's state after the capture.
#[must_use]
pub fn create_capture_finished_event(
    reason: StopCaptureReason,
    target: TargetProcessStateAfterCapture,
) -> CaptureFinished {
    let (status, error_message) = match reason {
        StopCaptureReason::ClientStop | StopCaptureReason::GuestOrcStop => {
            (CaptureStatus::Successful, "")
        }
        StopCaptureReason::MemoryWatchdog => {
            (CaptureStatus::InterruptedByService, "OrbitService was using too much memory.")
        }
        StopCaptureReason::ExceededMaxDurationLimit => (
            CaptureStatus::InterruptedByService,
            "Capture duration exceeded the maximum duration limit.",
        ),
        StopCaptureReason::GuestOrcConnectionFailure => {
            (CaptureStatus::Failed, "Connection with GuestOrc failed.")
        }
        StopCaptureReason::UploadFailure => (CaptureStatus::Failed, "Upload failed early."),
        StopCaptureReason::Unknown => (CaptureStatus::Failed, "Capture stopped due to unknown reason."),
    };
    CaptureFinished {
        status,
        error_message: error_message.to_string(),
        target_process_state: target.process_state,
        termination_signal: target.termination_signal,
    }
}

// ============================================================================
// Service base
// ============================================================================

/// Platform-neutral part of the capture service.
///
/// Guards the single-capture invariant, keeps the registered start/stop
/// listeners and frames every capture with `CaptureStarted`,
/// `ClockResolutionEvent` and `CaptureFinished`.
pub struct CaptureServiceBase {
    is_capturing: Mutex<bool>,
    listeners: Mutex<Vec<Arc<dyn CaptureStartStopListener>>>,
    clock_resolution_ns: u64,
    next_external_producer_id: AtomicU64,
    executable_path_query: Arc<dyn ExecutablePathQuery>,
    build_id_query: Arc<dyn BuildIdQuery>,
}

impl CaptureServiceBase {
    /// Estimates the clock resolution once for the lifetime of the service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: Mutex::new(false),
            listeners: Mutex::new(Vec::new()),
            clock_resolution_ns: clock::estimate_and_log_resolution_ns(),
            next_external_producer_id: AtomicU64::new(EXTERNAL_PRODUCER_START_ID),
            executable_path_query: Arc::new(ProcfsExecutablePathQuery::default()),
            build_id_query: Arc::new(ObjectFileBuildIdQuery),
        }
    }

    #[must_use]
    pub fn with_process_queries(
        mut self,
        executable_path_query: Arc<dyn ExecutablePathQuery>,
        build_id_query: Arc<dyn BuildIdQuery>,
    ) -> Self {
        self.executable_path_query = executable_path_query;
        self.build_id_query = build_id_query;
        self
    }

    #[must_use]
    pub fn clock_resolution_ns(&self) -> u64 {
        self.clock_resolution_ns
    }

    pub fn add_capture_start_stop_listener(&self, listener: Arc<dyn CaptureStartStopListener>) {
        let mut listeners = self.lock_listeners();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            warn!("Capture start/stop listener registered twice");
            return;
        }
        listeners.push(listener);
    }

    pub fn remove_capture_start_stop_listener(&self, listener: &Arc<dyn CaptureStartStopListener>) {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if listeners.len() == before {
            warn!("Removing a capture start/stop listener that was not registered");
        }
    }

    /// Listeners registered right now; later (un)registrations do not affect the copy.
    #[must_use]
    pub fn capture_start_stop_listeners(&self) -> Vec<Arc<dyn CaptureStartStopListener>> {
        self.lock_listeners().clone()
    }

    /// Next producer id for a producer connecting from outside the service.
    pub fn allocate_external_producer_id(&self) -> u64 {
        self.next_external_producer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim the service for a new capture writing to `collector`.
    ///
    /// # Errors
    /// Returns [`CaptureServiceError::AlreadyInProgress`] while another capture runs.
    pub fn initialize(
        &self,
        collector: Arc<dyn ClientCaptureEventCollector>,
    ) -> Result<CaptureSession<'_>, CaptureServiceError> {
        {
            let mut is_capturing = self.is_capturing.lock().unwrap_or_else(PoisonError::into_inner);
            if *is_capturing {
                error!("{}", CaptureServiceError::AlreadyInProgress);
                return Err(CaptureServiceError::AlreadyInProgress);
            }
            *is_capturing = true;
        }
        let processor: Arc<dyn ProducerEventProcessor> =
            Arc::new(InterningEventProcessor::new(Arc::clone(&collector)));
        Ok(CaptureSession {
            base: self,
            collector,
            processor,
            capture_start_timestamp_ns: None,
            finished: false,
        })
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Arc<dyn CaptureStartStopListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CaptureServiceBase {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Capture session
// ============================================================================

/// One capture, from `initialize` to `CaptureFinished`.
///
/// Dropping the session releases the service for the next capture; if it
/// was not finalized, the collector is still flushed and stopped.
pub struct CaptureSession<'a> {
    base: &'a CaptureServiceBase,
    collector: Arc<dyn ClientCaptureEventCollector>,
    processor: Arc<dyn ProducerEventProcessor>,
    capture_start_timestamp_ns: Option<u64>,
    finished: bool,
}

impl CaptureSession<'_> {
    /// Processor every producer of this capture sends its events to.
    #[must_use]
    pub fn processor(&self) -> Arc<dyn ProducerEventProcessor> {
        Arc::clone(&self.processor)
    }

    #[must_use]
    pub fn capture_start_timestamp_ns(&self) -> Option<u64> {
        self.capture_start_timestamp_ns
    }

    /// Emit `CaptureStarted` and `ClockResolutionEvent`, in that order and
    /// with the same timestamp. Returns that timestamp.
    ///
    /// # Panics
    /// Panics if called twice for the same capture.
    pub fn start_event_processing(&mut self, options: &CaptureOptions) -> u64 {
        assert!(
            self.capture_start_timestamp_ns.is_none(),
            "CaptureStarted already emitted for this capture"
        );
        let timestamp_ns = clock::now_ns();
        self.capture_start_timestamp_ns = Some(timestamp_ns);
        info!("Starting capture of {}", Pid(options.pid));

        let started = create_capture_started_event(
            options,
            timestamp_ns,
            self.base.executable_path_query.as_ref(),
            self.base.build_id_query.as_ref(),
        );
        self.emit(ProducerCaptureEvent::CaptureStarted(started));
        self.emit(ProducerCaptureEvent::ClockResolutionEvent(create_clock_resolution_event(
            timestamp_ns,
            self.base.clock_resolution_ns,
        )));
        timestamp_ns
    }

    /// Emit a framing event with the root producer id.
    pub fn emit(&self, event: ProducerCaptureEvent) {
        self.processor.process_event(ROOT_PRODUCER_ID, event);
    }

    /// Emit `CaptureFinished` and wait until the collector has written everything.
    pub fn finalize_event_processing(
        mut self,
        reason: StopCaptureReason,
        target: TargetProcessStateAfterCapture,
    ) {
        let finished = create_capture_finished_event(reason, target);
        info!(
            "Capture finished ({reason}): status {:?}, target process {:?}",
            finished.status, finished.target_process_state
        );
        self.emit(ProducerCaptureEvent::CaptureFinished(finished));
        self.collector.stop_and_wait();
        self.finished = true;
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.collector.stop_and_wait();
        }
        *self.base.is_capturing.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorMessage;
    use orbit_protos::{ClientCaptureEvent, ProcessState, TerminationSignal};
    use std::path::{Path, PathBuf};

    #[derive(Default)]
    struct VecCollector {
        events: Mutex<Vec<ClientCaptureEvent>>,
        stops: Mutex<u32>,
    }

    impl ClientCaptureEventCollector for VecCollector {
        fn add_event(&self, event: ClientCaptureEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn stop_and_wait(&self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    struct FixedPath;

    impl ExecutablePathQuery for FixedPath {
        fn executable_path(&self, _pid: Pid) -> Result<PathBuf, ErrorMessage> {
            Ok(PathBuf::from("/usr/bin/target"))
        }
    }

    struct FixedBuildId;

    impl BuildIdQuery for FixedBuildId {
        fn build_id_for(&self, path: &Path) -> Result<String, ErrorMessage> {
            assert_eq!(path, Path::new("/usr/bin/target"));
            Ok("abcd".to_string())
        }
    }

    struct NoPath;

    impl ExecutablePathQuery for NoPath {
        fn executable_path(&self, pid: Pid) -> Result<PathBuf, ErrorMessage> {
            Err(ErrorMessage::new(format!("{pid} is gone")))
        }
    }

    fn base() -> CaptureServiceBase {
        CaptureServiceBase::new().with_process_queries(Arc::new(FixedPath), Arc::new(FixedBuildId))
    }

    const RUNNING: TargetProcessStateAfterCapture = TargetProcessStateAfterCapture {
        process_state: ProcessState::Running,
        termination_signal: TerminationSignal::Unspecified,
    };

    #[test]
    fn test_capture_finished_mapping() {
        let cases = [
            (StopCaptureReason::ClientStop, CaptureStatus::Successful, ""),
            (StopCaptureReason::GuestOrcStop, CaptureStatus::Successful, ""),
            (
                StopCaptureReason::MemoryWatchdog,
                CaptureStatus::InterruptedByService,
                "OrbitService was using too much memory.",
            ),
            (
                StopCaptureReason::ExceededMaxDurationLimit,
                CaptureStatus::InterruptedByService,
                "Capture duration exceeded the maximum duration limit.",
            ),
            (
                StopCaptureReason::GuestOrcConnectionFailure,
                CaptureStatus::Failed,
                "Connection with GuestOrc failed.",
            ),
            (StopCaptureReason::UploadFailure, CaptureStatus::Failed, "Upload failed early."),
            (StopCaptureReason::Unknown, CaptureStatus::Failed, "Capture stopped due to unknown reason."),
        ];
        for (reason, status, message) in cases {
            let finished = create_capture_finished_event(reason, RUNNING);
            assert_eq!(finished.status, status, "{reason}");
            assert_eq!(finished.error_message, message, "{reason}");
            assert_eq!(finished.target_process_state, ProcessState::Running);
        }
    }

    #[test]
    fn test_session_frames_capture() {
        let base = base();
        let collector = Arc::new(VecCollector::default());
        let mut session = base.initialize(collector.clone()).unwrap();
        let mut options = CaptureOptions::for_pid(42);
        options.enable_api = true;
        let start = session.start_event_processing(&options);
        assert_eq!(session.capture_start_timestamp_ns(), Some(start));
        session.finalize_event_processing(StopCaptureReason::ClientStop, RUNNING);

        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::CaptureStarted(started) = &events[0] else {
            panic!("expected CaptureStarted first");
        };
        assert_eq!(started.process_id, 42);
        assert_eq!(started.executable_path, "/usr/bin/target");
        assert_eq!(started.executable_build_id, "abcd");
        assert_eq!(started.capture_start_timestamp_ns, start);
        assert_eq!(started.capture_options, options);
        let ClientCaptureEvent::ClockResolutionEvent(resolution) = &events[1] else {
            panic!("expected ClockResolutionEvent second");
        };
        assert_eq!(resolution.timestamp_ns, start);
        assert_eq!(resolution.clock_resolution_ns, base.clock_resolution_ns());
        assert!(events[2].is_capture_finished());
        assert_eq!(*collector.stops.lock().unwrap(), 1);
    }

    #[test]
    fn test_second_capture_rejected_until_session_dropped() {
        let base = base();
        let first = base.initialize(Arc::new(VecCollector::default())).unwrap();
        let second_collector = Arc::new(VecCollector::default());
        assert!(matches!(
            base.initialize(second_collector.clone()),
            Err(CaptureServiceError::AlreadyInProgress)
        ));
        assert!(second_collector.events.lock().unwrap().is_empty());

        drop(first);
        assert!(base.initialize(Arc::new(VecCollector::default())).is_ok());
    }

    #[test]
    fn test_unfinished_session_still_stops_collector() {
        let base = base();
        let collector = Arc::new(VecCollector::default());
        drop(base.initialize(collector.clone()).unwrap());
        assert_eq!(*collector.stops.lock().unwrap(), 1);
        assert!(collector.events.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "already emitted")]
    fn test_double_start_event_processing_panics() {
        let base = base();
        let mut session = base.initialize(Arc::new(VecCollector::default())).unwrap();
        session.start_event_processing(&CaptureOptions::for_pid(1));
        session.start_event_processing(&CaptureOptions::for_pid(1));
    }

    #[test]
    fn test_capture_started_with_unknown_executable() {
        let started = create_capture_started_event(&CaptureOptions::for_pid(9), 5, &NoPath, &FixedBuildId);
        assert_eq!(started.executable_path, "");
        assert_eq!(started.executable_build_id, "");
        assert_eq!(started.orbit_version_minor, version_component(env!("CARGO_PKG_VERSION_MINOR")));
    }

    #[test]
    fn test_external_producer_ids_start_after_reserved_range() {
        let base = base();
        assert_eq!(base.allocate_external_producer_id(), EXTERNAL_PRODUCER_START_ID);
        assert_eq!(base.allocate_external_producer_id(), EXTERNAL_PRODUCER_START_ID + 1);
    }
}
