use super::base::{
    create_error_enabling_orbit_api_event, create_error_enabling_user_space_instrumentation_event,
    create_warning_event,
};
use super::{
    create_introspection_listener, stop_in_parallel, CaptureServiceBase, CaptureSession,
    CaptureStartStopListener,
};
use crate::api_loader::OrbitApiLoader;
use crate::clock;
use crate::collector::{ClientCaptureEventCollector, StreamClientCaptureEventCollector};
use crate::domain::{CaptureServiceError, ErrorMessage, Pid};
use crate::instrumentation::{
    create_warning_instrumenting_with_user_space_instrumentation_event,
    filter_out_instrumented_functions, InstrumentationManager, InstrumentationReport,
    UserSpaceInstrumentationAddresses,
};
use crate::introspection;
use crate::memory_info::MemoryInfoHandler;
use crate::postmortem::{PostMortem, PostMortemConfig};
use crate::processor::{FunctionEntryExitHijacker, ProducerEventProcessor};
use crate::stop_slot::StopSlot;
use crate::stop_waiter::{StopCaptureReason, StopCaptureRequestWaiter, StreamStopCaptureRequestWaiter};
use crate::tracing::{TracerFactory, TracingHandler};
use crate::transport::{CaptureRequestReader, CaptureResponseWriter};
use crate::watchdog::{MemoryWatchdog, MemoryWatchdogConfig};
use log::{error, info, warn};
use orbit_protos::{CaptureOptions, ProducerCaptureEvent, LINUX_TRACING_PRODUCER_ID};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Capture service for Linux targets.
///
/// Collaborators that are not configured count as unavailable: asking for
/// the Orbit API or user-space instrumentation without them is reported to
/// the client as an error event, and the capture goes on.
pub struct LinuxCaptureService {
    base: CaptureServiceBase,
    tracer_factory: Arc<dyn TracerFactory>,
    instrumentation_manager: Option<Arc<dyn InstrumentationManager>>,
    api_loader: Option<Arc<dyn OrbitApiLoader>>,
    memory_watchdog: Option<MemoryWatchdog>,
    post_mortem: PostMortem,
    /// Outlives the capture that started it; joined when the next capture starts.
    wait_for_stop_thread: Mutex<Option<JoinHandle<()>>>,
}

/// What the start sequence produced, kept for finalization.
struct StartedProducers {
    tracing_handler: Arc<TracingHandler>,
    memory_info_handler: MemoryInfoHandler,
    introspection_listener: Option<introspection::IntrospectionListener>,
}

impl LinuxCaptureService {
    /// Service with the default post-mortem locations and a memory watchdog
    /// sized from the machine's physical memory.
    ///
    /// # Errors
    /// Returns an [`ErrorMessage`] if the post-mortem cannot be set up.
    pub fn new(tracer_factory: Arc<dyn TracerFactory>) -> Result<Self, ErrorMessage> {
        let memory_watchdog = match MemoryWatchdogConfig::from_system() {
            Ok(config) => Some(MemoryWatchdog::new(config)),
            Err(e) => {
                warn!("Memory watchdog disabled: {e}");
                None
            }
        };
        Ok(Self {
            base: CaptureServiceBase::new(),
            tracer_factory,
            instrumentation_manager: None,
            api_loader: None,
            memory_watchdog,
            post_mortem: PostMortem::new(PostMortemConfig::default())?,
            wait_for_stop_thread: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_base(mut self, base: CaptureServiceBase) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn with_instrumentation_manager(mut self, manager: Arc<dyn InstrumentationManager>) -> Self {
        self.instrumentation_manager = Some(manager);
        self
    }

    #[must_use]
    pub fn with_api_loader(mut self, loader: Arc<dyn OrbitApiLoader>) -> Self {
        self.api_loader = Some(loader);
        self
    }

    /// Replace the memory watchdog; `None` disables it.
    #[must_use]
    pub fn with_memory_watchdog(mut self, watchdog: Option<MemoryWatchdog>) -> Self {
        self.memory_watchdog = watchdog;
        self
    }

    /// # Errors
    /// Returns an [`ErrorMessage`] if the post-mortem cannot be set up.
    pub fn with_post_mortem_config(mut self, config: PostMortemConfig) -> Result<Self, ErrorMessage> {
        self.post_mortem = PostMortem::new(config)?;
        Ok(self)
    }

    #[must_use]
    pub fn base(&self) -> &CaptureServiceBase {
        &self.base
    }

    pub fn add_capture_start_stop_listener(&self, listener: Arc<dyn CaptureStartStopListener>) {
        self.base.add_capture_start_stop_listener(listener);
    }

    /// Serve one capture over a bidirectional request/response stream.
    ///
    /// # Errors
    /// Returns [`CaptureServiceError::AlreadyInProgress`] without emitting
    /// anything if another capture runs, and
    /// [`CaptureServiceError::MissingCaptureRequest`] if the client closed
    /// the stream before asking for a capture.
    pub fn capture(
        &self,
        reader: Box<dyn CaptureRequestReader>,
        writer: Box<dyn CaptureResponseWriter>,
    ) -> Result<(), CaptureServiceError> {
        let collector = Arc::new(StreamClientCaptureEventCollector::new(writer));
        let waiter = Arc::new(StreamStopCaptureRequestWaiter::new(reader));
        self.capture_with(collector, waiter)
    }

    /// Run one capture writing to `collector`, started and stopped by `waiter`.
    ///
    /// # Errors
    /// See [`capture`](Self::capture).
    pub fn capture_with(
        &self,
        collector: Arc<dyn ClientCaptureEventCollector>,
        waiter: Arc<dyn StopCaptureRequestWaiter>,
    ) -> Result<(), CaptureServiceError> {
        let session = self.base.initialize(collector)?;
        self.join_wait_for_stop_thread();

        let Some(options) = waiter.wait_for_start_capture_request() else {
            warn!("{}", CaptureServiceError::MissingCaptureRequest);
            return Err(CaptureServiceError::MissingCaptureRequest);
        };
        self.do_capture(session, &options, waiter);
        Ok(())
    }

    /// Reap the previous capture's stop waiter. A waiter still blocked on a
    /// client that never closed its stream is detached rather than joined.
    fn join_wait_for_stop_thread(&self) {
        let handle = self.wait_for_stop_thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        if !handle.is_finished() {
            warn!("Previous stop request waiter is still blocked on its stream; detaching it");
            return;
        }
        if handle.join().is_err() {
            error!("Stop request waiter thread panicked");
        }
    }

    fn do_capture(
        &self,
        mut session: CaptureSession<'_>,
        options: &CaptureOptions,
        waiter: Arc<dyn StopCaptureRequestWaiter>,
    ) {
        let pid = Pid(options.pid);
        let old_core_files = self.post_mortem.snapshot_core_files();
        let processor = session.processor();
        let started = self.start_capture(&mut session, options, &processor);

        let reason = self.wait_for_stop_capture_request_or_memory_threshold_exceeded(
            waiter,
            options.max_capture_duration().map(|d| Instant::now() + d),
        );
        info!("Stopping capture: {reason}");

        let finalize_scope = introspection::scope("LinuxCaptureService::finalize");
        self.disable_api(&session, options);
        self.uninstrument(&session, options);

        let StartedProducers { tracing_handler, memory_info_handler, introspection_listener } =
            started;
        {
            let _scope = introspection::scope("Stop producers and listeners");
            let stop_tracing = || tracing_handler.stop();
            let stop_memory_info = || memory_info_handler.stop();
            let internal_stops: [&(dyn Fn() + Sync); 2] = [&stop_tracing, &stop_memory_info];
            stop_in_parallel(&internal_stops, &self.base.capture_start_stop_listeners());
        }
        drop(finalize_scope);
        // Dropping the listener is what turns introspection off.
        drop(introspection_listener);

        let target = self.post_mortem.target_process_state(pid, &old_core_files);
        session.finalize_event_processing(reason, target);
    }

    fn start_capture(
        &self,
        session: &mut CaptureSession<'_>,
        options: &CaptureOptions,
        processor: &Arc<dyn ProducerEventProcessor>,
    ) -> StartedProducers {
        let tracing_handler = Arc::new(TracingHandler::new(
            self.tracer_factory.as_ref(),
            Arc::clone(processor),
            LINUX_TRACING_PRODUCER_ID,
        ));
        let hijacker: Arc<dyn ProducerEventProcessor> = Arc::new(FunctionEntryExitHijacker::new(
            Arc::clone(processor),
            tracing_handler.clone(),
        ));
        let memory_info_handler =
            MemoryInfoHandler::new(Arc::clone(processor), self.post_mortem.config().proc_root.clone());

        let error_enabling_orbit_api = self.enable_api(options);

        let mut tracer_options = options.clone();
        let mut error_enabling_user_space_instrumentation = None;
        let mut instrumentation_failures = None;
        let mut addresses: Option<Arc<UserSpaceInstrumentationAddresses>> = None;
        if options.uses_user_space_instrumentation() {
            match self.instrument(options) {
                Err(message) => {
                    error!("{message}");
                    error_enabling_user_space_instrumentation = Some(message);
                }
                Ok((report, report_addresses)) => {
                    filter_out_instrumented_functions(
                        &report.instrumented_function_ids,
                        &mut tracer_options,
                    );
                    info!(
                        "User space instrumentation enabled for {} out of {} instrumented functions.",
                        report.instrumented_function_ids.len(),
                        options.instrumented_functions.len()
                    );
                    addresses = Some(Arc::new(report_addresses));
                    if !report.function_ids_to_error_messages.is_empty() {
                        instrumentation_failures = Some(report.function_ids_to_error_messages);
                    }
                }
            }
        }

        let start_timestamp_ns = session.start_event_processing(options);
        if let Some(message) = error_enabling_orbit_api {
            session.emit(ProducerCaptureEvent::ErrorEnablingOrbitApiEvent(
                create_error_enabling_orbit_api_event(start_timestamp_ns, message),
            ));
        }
        if let Some(message) = error_enabling_user_space_instrumentation {
            session.emit(ProducerCaptureEvent::ErrorEnablingUserSpaceInstrumentationEvent(
                create_error_enabling_user_space_instrumentation_event(start_timestamp_ns, message),
            ));
        }
        if let Some(failures) = instrumentation_failures {
            session.emit(ProducerCaptureEvent::WarningInstrumentingWithUserSpaceInstrumentationEvent(
                create_warning_instrumenting_with_user_space_instrumentation_event(
                    start_timestamp_ns,
                    &failures,
                ),
            ));
        }

        let introspection_listener = options
            .enable_introspection
            .then(|| create_introspection_listener(Arc::clone(processor)));

        tracing_handler.start(tracer_options, addresses);
        memory_info_handler.start(options);
        for listener in self.base.capture_start_stop_listeners() {
            listener.on_capture_start_requested(options, Arc::clone(&hijacker));
        }

        StartedProducers { tracing_handler, memory_info_handler, introspection_listener }
    }

    /// Error message for the client if the API could not be enabled.
    fn enable_api(&self, options: &CaptureOptions) -> Option<String> {
        if !options.enable_api {
            return None;
        }
        let result = match &self.api_loader {
            Some(loader) => loader.enable_api(options),
            None => Err(ErrorMessage::new("Orbit API loader is not available")),
        };
        result.err().map(|e| {
            error!("Enabling Orbit Api: {e}");
            format!("Could not enable Orbit API: {e}")
        })
    }

    /// The report and the trampoline addresses it describes. A report with
    /// unusable addresses counts as a failure to instrument.
    fn instrument(
        &self,
        options: &CaptureOptions,
    ) -> Result<(InstrumentationReport, UserSpaceInstrumentationAddresses), String> {
        let manager = self
            .instrumentation_manager
            .as_ref()
            .ok_or_else(|| ErrorMessage::new("Instrumentation manager is not available"));
        manager
            .and_then(|m| m.instrument_process(options))
            .and_then(|report| {
                let addresses = report.addresses()?;
                Ok((report, addresses))
            })
            .map_err(|e| format!("Could not enable user space instrumentation: {e}"))
    }

    fn disable_api(&self, session: &CaptureSession<'_>, options: &CaptureOptions) {
        if !options.enable_api {
            return;
        }
        let Some(loader) = &self.api_loader else {
            return;
        };
        if let Err(e) = loader.disable_api(options) {
            error!("Disabling Orbit Api: {e}");
            session.emit(ProducerCaptureEvent::WarningEvent(create_warning_event(
                clock::now_ns(),
                format!("Could not disable Orbit API: {e}"),
            )));
        }
    }

    fn uninstrument(&self, session: &CaptureSession<'_>, options: &CaptureOptions) {
        if !options.uses_user_space_instrumentation() {
            return;
        }
        let Some(manager) = &self.instrumentation_manager else {
            return;
        };
        if let Err(e) = manager.uninstrument_process(Pid(options.pid)) {
            error!("Disabling user space instrumentation: {e}");
            session.emit(ProducerCaptureEvent::WarningEvent(create_warning_event(
                clock::now_ns(),
                format!("Could not disable user space instrumentation: {e}"),
            )));
        }
    }

    /// Block until the waiter, the memory watchdog or the duration cap stops the capture.
    fn wait_for_stop_capture_request_or_memory_threshold_exceeded(
        &self,
        waiter: Arc<dyn StopCaptureRequestWaiter>,
        deadline: Option<Instant>,
    ) -> StopCaptureReason {
        let stop = Arc::new(StopSlot::new());

        let waiter_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let reason = waiter.wait_for_stop_capture_request();
            if waiter_stop.request_stop(reason) {
                info!("Client finished writing on Capture's gRPC stream: stopping capture");
            } else {
                info!("Client finished writing on Capture's gRPC stream, but the capture was already stopped");
            }
        });
        *self.wait_for_stop_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        thread::scope(|scope| {
            if let Some(watchdog) = &self.memory_watchdog {
                let watchdog_stop = Arc::clone(&stop);
                scope.spawn(move || watchdog.run(&watchdog_stop));
            }
            let Some(deadline) = deadline else {
                return;
            };
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    if stop.request_stop(StopCaptureReason::ExceededMaxDurationLimit) {
                        info!("Capture reached its maximum duration: stopping capture");
                    }
                    return;
                }
                if stop.wait_timeout(remaining) {
                    return;
                }
            }
        });

        stop.wait()
    }
}
