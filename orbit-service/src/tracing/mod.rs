//! Kernel-level tracing behind a narrow seam.
//!
//! The capture service never talks to `perf_event_open` or ETW directly. It
//! creates a [`Tracer`] through a [`TracerFactory`], and the tracer reports
//! what it observes through the typed callbacks of [`TracerListener`].
//! [`TracingHandler`] owns one tracer per capture and forwards every callback
//! to the producer event processor under a single producer id.
//!
//! ```text
//! TracerFactory ──create──▶ Tracer ──on_*()──▶ ProducerEventForwarder ──▶ processor
//!                             ▲
//!        FunctionEntry/Exit ──┘ (from the user-space instrumentation hijacker)
//! ```

mod handler;
mod procfs_tracer;

pub use handler::{ProducerEventForwarder, TracingHandler};
pub use procfs_tracer::ProcfsTracer;

use crate::instrumentation::UserSpaceInstrumentationAddresses;
use orbit_protos::{
    ApiScopeStart, ApiScopeStartAsync, ApiScopeStop, ApiScopeStopAsync, ApiStringEvent,
    ApiTrackDouble, ApiTrackFloat, ApiTrackInt, ApiTrackInt64, ApiTrackUint, ApiTrackUint64,
    CaptureOptions, ErrorsWithPerfEventOpenEvent, FullAddressInfo, FullCallstackSample,
    FullGpuJob, FullTracepointEvent, FunctionCall, FunctionEntry, FunctionExit,
    LostPerfRecordsEvent, ModuleUpdateEvent, ModulesSnapshot, OutOfOrderEventsDiscardedEvent,
    PresentEvent, SchedulingSlice, ThreadName, ThreadNamesSnapshot, ThreadStateSlice,
    ThreadStateSliceCallstack, WarningEvent, WarningInstrumentingWithUprobesEvent,
};
use std::sync::Arc;

/// A platform tracer for one capture.
pub trait Tracer: Send + Sync {
    /// Begin tracing. `addresses` is set when user-space instrumentation is
    /// active and callstacks have to be classified against the trampolines.
    fn start(
        &self,
        options: CaptureOptions,
        addresses: Option<Arc<UserSpaceInstrumentationAddresses>>,
        listener: Arc<dyn TracerListener>,
    );

    /// Stop tracing. Every callback has returned when this returns.
    fn stop(&self);

    /// Entry into a function instrumented from user space.
    fn process_function_entry(&self, entry: FunctionEntry);

    /// Exit from the innermost function instrumented from user space.
    fn process_function_exit(&self, exit: FunctionExit);
}

/// Creates a fresh tracer for each capture.
pub trait TracerFactory: Send + Sync {
    fn create_tracer(&self) -> Arc<dyn Tracer>;
}

impl<F> TracerFactory for F
where
    F: Fn() -> Arc<dyn Tracer> + Send + Sync,
{
    fn create_tracer(&self) -> Arc<dyn Tracer> {
        self()
    }
}

/// Receives everything a [`Tracer`] observes.
///
/// Callbacks may arrive on any tracer thread, but the events of one kind
/// keep the order in which the tracer produced them.
pub trait TracerListener: Send + Sync {
    fn on_scheduling_slice(&self, slice: SchedulingSlice);
    fn on_callstack_sample(&self, sample: FullCallstackSample);
    fn on_function_call(&self, call: FunctionCall);
    fn on_thread_name(&self, name: ThreadName);
    fn on_thread_names_snapshot(&self, snapshot: ThreadNamesSnapshot);
    fn on_thread_state_slice(&self, slice: ThreadStateSlice);
    fn on_thread_state_slice_callstack(&self, callstack: ThreadStateSliceCallstack);
    fn on_address_info(&self, info: FullAddressInfo);
    fn on_tracepoint_event(&self, event: FullTracepointEvent);
    fn on_gpu_job(&self, job: FullGpuJob);
    fn on_present_event(&self, event: PresentEvent);
    fn on_module_update(&self, event: ModuleUpdateEvent);
    fn on_modules_snapshot(&self, snapshot: ModulesSnapshot);
    fn on_errors_with_perf_event_open(&self, event: ErrorsWithPerfEventOpenEvent);
    fn on_lost_perf_records(&self, event: LostPerfRecordsEvent);
    fn on_out_of_order_events_discarded(&self, event: OutOfOrderEventsDiscardedEvent);
    fn on_warning_event(&self, event: WarningEvent);
    fn on_warning_instrumenting_with_uprobes(&self, event: WarningInstrumentingWithUprobesEvent);

    fn on_api_scope_start(&self, event: ApiScopeStart);
    fn on_api_scope_start_async(&self, event: ApiScopeStartAsync);
    fn on_api_scope_stop(&self, event: ApiScopeStop);
    fn on_api_scope_stop_async(&self, event: ApiScopeStopAsync);
    fn on_api_string_event(&self, event: ApiStringEvent);
    fn on_api_track_int(&self, event: ApiTrackInt);
    fn on_api_track_int64(&self, event: ApiTrackInt64);
    fn on_api_track_uint(&self, event: ApiTrackUint);
    fn on_api_track_uint64(&self, event: ApiTrackUint64);
    fn on_api_track_float(&self, event: ApiTrackFloat);
    fn on_api_track_double(&self, event: ApiTrackDouble);
}
