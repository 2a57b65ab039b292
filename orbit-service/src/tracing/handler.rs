use super::{Tracer, TracerFactory, TracerListener};
use crate::instrumentation::UserSpaceInstrumentationAddresses;
use crate::processor::{FunctionEntryExitSink, ProducerEventProcessor};
use log::{error, info};
use orbit_protos::{
    ApiScopeStart, ApiScopeStartAsync, ApiScopeStop, ApiScopeStopAsync, ApiStringEvent,
    ApiTrackDouble, ApiTrackFloat, ApiTrackInt, ApiTrackInt64, ApiTrackUint, ApiTrackUint64,
    CallstackType, CaptureOptions, ErrorsWithPerfEventOpenEvent, FullAddressInfo,
    FullCallstackSample, FullGpuJob, FullTracepointEvent, FunctionCall, FunctionEntry,
    FunctionExit, LostPerfRecordsEvent, ModuleUpdateEvent, ModulesSnapshot,
    OutOfOrderEventsDiscardedEvent, PresentEvent, ProducerCaptureEvent, SchedulingSlice,
    ThreadName, ThreadNamesSnapshot, ThreadStateSlice, ThreadStateSliceCallstack, WarningEvent,
    WarningInstrumentingWithUprobesEvent,
};
use std::sync::{Arc, Mutex, PoisonError};

/// [`TracerListener`] handing every callback to a [`ProducerEventProcessor`].
///
/// With user-space instrumentation active, complete callstacks are
/// re-classified against the trampoline ranges before being forwarded.
pub struct ProducerEventForwarder {
    processor: Arc<dyn ProducerEventProcessor>,
    producer_id: u64,
    addresses: Option<Arc<UserSpaceInstrumentationAddresses>>,
}

impl ProducerEventForwarder {
    #[must_use]
    pub fn new(
        processor: Arc<dyn ProducerEventProcessor>,
        producer_id: u64,
        addresses: Option<Arc<UserSpaceInstrumentationAddresses>>,
    ) -> Self {
        Self { processor, producer_id, addresses }
    }

    fn forward(&self, event: ProducerCaptureEvent) {
        self.processor.process_event(self.producer_id, event);
    }

    fn classify(&self, pcs: &[u64], callstack_type: CallstackType) -> CallstackType {
        match &self.addresses {
            Some(addresses) if callstack_type == CallstackType::Complete => {
                addresses.classify_callstack(pcs)
            }
            _ => callstack_type,
        }
    }
}

impl TracerListener for ProducerEventForwarder {
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {
        self.forward(ProducerCaptureEvent::SchedulingSlice(slice));
    }

    fn on_callstack_sample(&self, mut sample: FullCallstackSample) {
        sample.callstack.callstack_type =
            self.classify(&sample.callstack.pcs, sample.callstack.callstack_type);
        self.forward(ProducerCaptureEvent::FullCallstackSample(sample));
    }

    fn on_function_call(&self, call: FunctionCall) {
        self.forward(ProducerCaptureEvent::FunctionCall(call));
    }

    fn on_thread_name(&self, name: ThreadName) {
        self.forward(ProducerCaptureEvent::ThreadName(name));
    }

    fn on_thread_names_snapshot(&self, snapshot: ThreadNamesSnapshot) {
        self.forward(ProducerCaptureEvent::ThreadNamesSnapshot(snapshot));
    }

    fn on_thread_state_slice(&self, slice: ThreadStateSlice) {
        self.forward(ProducerCaptureEvent::ThreadStateSlice(slice));
    }

    fn on_thread_state_slice_callstack(&self, mut callstack: ThreadStateSliceCallstack) {
        callstack.callstack.callstack_type =
            self.classify(&callstack.callstack.pcs, callstack.callstack.callstack_type);
        self.forward(ProducerCaptureEvent::ThreadStateSliceCallstack(callstack));
    }

    fn on_address_info(&self, info: FullAddressInfo) {
        self.forward(ProducerCaptureEvent::AddressInfo(info));
    }

    fn on_tracepoint_event(&self, event: FullTracepointEvent) {
        self.forward(ProducerCaptureEvent::FullTracepointEvent(event));
    }

    fn on_gpu_job(&self, job: FullGpuJob) {
        self.forward(ProducerCaptureEvent::FullGpuJob(job));
    }

    fn on_present_event(&self, event: PresentEvent) {
        self.forward(ProducerCaptureEvent::PresentEvent(event));
    }

    fn on_module_update(&self, event: ModuleUpdateEvent) {
        self.forward(ProducerCaptureEvent::ModuleUpdateEvent(event));
    }

    fn on_modules_snapshot(&self, snapshot: ModulesSnapshot) {
        self.forward(ProducerCaptureEvent::ModulesSnapshot(snapshot));
    }

    fn on_errors_with_perf_event_open(&self, event: ErrorsWithPerfEventOpenEvent) {
        self.forward(ProducerCaptureEvent::ErrorsWithPerfEventOpenEvent(event));
    }

    fn on_lost_perf_records(&self, event: LostPerfRecordsEvent) {
        self.forward(ProducerCaptureEvent::LostPerfRecordsEvent(event));
    }

    fn on_out_of_order_events_discarded(&self, event: OutOfOrderEventsDiscardedEvent) {
        self.forward(ProducerCaptureEvent::OutOfOrderEventsDiscardedEvent(event));
    }

    fn on_warning_event(&self, event: WarningEvent) {
        self.forward(ProducerCaptureEvent::WarningEvent(event));
    }

    fn on_warning_instrumenting_with_uprobes(&self, event: WarningInstrumentingWithUprobesEvent) {
        self.forward(ProducerCaptureEvent::WarningInstrumentingWithUprobesEvent(event));
    }

    fn on_api_scope_start(&self, event: ApiScopeStart) {
        self.forward(ProducerCaptureEvent::ApiScopeStart(event));
    }

    fn on_api_scope_start_async(&self, event: ApiScopeStartAsync) {
        self.forward(ProducerCaptureEvent::ApiScopeStartAsync(event));
    }

    fn on_api_scope_stop(&self, event: ApiScopeStop) {
        self.forward(ProducerCaptureEvent::ApiScopeStop(event));
    }

    fn on_api_scope_stop_async(&self, event: ApiScopeStopAsync) {
        self.forward(ProducerCaptureEvent::ApiScopeStopAsync(event));
    }

    fn on_api_string_event(&self, event: ApiStringEvent) {
        self.forward(ProducerCaptureEvent::ApiStringEvent(event));
    }

    fn on_api_track_int(&self, event: ApiTrackInt) {
        self.forward(ProducerCaptureEvent::ApiTrackInt(event));
    }

    fn on_api_track_int64(&self, event: ApiTrackInt64) {
        self.forward(ProducerCaptureEvent::ApiTrackInt64(event));
    }

    fn on_api_track_uint(&self, event: ApiTrackUint) {
        self.forward(ProducerCaptureEvent::ApiTrackUint(event));
    }

    fn on_api_track_uint64(&self, event: ApiTrackUint64) {
        self.forward(ProducerCaptureEvent::ApiTrackUint64(event));
    }

    fn on_api_track_float(&self, event: ApiTrackFloat) {
        self.forward(ProducerCaptureEvent::ApiTrackFloat(event));
    }

    fn on_api_track_double(&self, event: ApiTrackDouble) {
        self.forward(ProducerCaptureEvent::ApiTrackDouble(event));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Idle,
    Running,
    Stopped,
}

/// Owns the tracer of one capture.
///
/// Single use: `start` at most once, then `stop`. Function entries and exits
/// received while the tracer is not running are dropped.
pub struct TracingHandler {
    processor: Arc<dyn ProducerEventProcessor>,
    producer_id: u64,
    tracer: Arc<dyn Tracer>,
    state: Mutex<HandlerState>,
}

impl TracingHandler {
    #[must_use]
    pub fn new(
        factory: &dyn TracerFactory,
        processor: Arc<dyn ProducerEventProcessor>,
        producer_id: u64,
    ) -> Self {
        Self {
            processor,
            producer_id,
            tracer: factory.create_tracer(),
            state: Mutex::new(HandlerState::Idle),
        }
    }

    /// # Panics
    /// Panics if the handler was already started.
    pub fn start(
        &self,
        options: CaptureOptions,
        addresses: Option<Arc<UserSpaceInstrumentationAddresses>>,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*state, HandlerState::Idle, "TracingHandler started twice");
        let listener = Arc::new(ProducerEventForwarder::new(
            Arc::clone(&self.processor),
            self.producer_id,
            addresses.clone(),
        ));
        self.tracer.start(options, addresses, listener);
        *state = HandlerState::Running;
    }

    /// Stop the tracer. No-op unless running.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != HandlerState::Running {
            return;
        }
        self.tracer.stop();
        *state = HandlerState::Stopped;
        info!("TracingHandler stopped: perf_event_open tracing is done");
    }

    fn is_running(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == HandlerState::Running
    }
}

impl FunctionEntryExitSink for TracingHandler {
    fn process_function_entry(&self, entry: FunctionEntry) {
        if self.is_running() {
            self.tracer.process_function_entry(entry);
        } else {
            error!("Dropping FunctionEntry received while the tracer is not running");
        }
    }

    fn process_function_exit(&self, exit: FunctionExit) {
        if self.is_running() {
            self.tracer.process_function_exit(exit);
        } else {
            error!("Dropping FunctionExit received while the tracer is not running");
        }
    }
}
