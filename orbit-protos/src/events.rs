//! Event payloads.
//!
//! Payloads are plain data. Most of them travel unchanged from producer to client;
//! the `Full*` variants carry strings or callstacks inline and are converted by the
//! processor into interned client variants that reference a key instead.

use serde::{Deserialize, Serialize};

// ============================================================================
// Scheduling and Callstacks
// ============================================================================

/// A time slice during which `tid` ran on `core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingSlice {
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    pub duration_ns: u64,
    pub out_timestamp_ns: u64,
}

/// Outcome of unwinding a callstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallstackType {
    #[default]
    Complete,
    DwarfUnwindingError,
    FramePointerUnwindingError,
    /// Innermost frame is inside a user-space instrumentation trampoline
    InUserSpaceInstrumentation,
    /// A return-trampoline frame could not be replaced with the real return address
    CallstackPatchingFailed,
}

/// Program counters, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Callstack {
    pub pcs: Vec<u64>,
    pub callstack_type: CallstackType,
}

/// A callstack sent once and afterwards referenced by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternedCallstack {
    pub key: u64,
    pub intern: Callstack,
}

/// Producer-side callstack sample carrying the callstack inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullCallstackSample {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub callstack: Callstack,
}

/// Callstack sample referencing an interned callstack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallstackSample {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub callstack_id: u64,
}

// ============================================================================
// Dynamic Instrumentation
// ============================================================================

/// One completed call of an instrumented function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub pid: u32,
    pub tid: u32,
    pub function_id: u64,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    /// Number of enclosing instrumented calls on the same thread
    pub depth: i32,
    pub return_value: u64,
    pub registers: Vec<u64>,
}

/// Entry into an instrumented function, reported by a user-space trampoline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub pid: u32,
    pub tid: u32,
    pub function_id: u64,
    pub stack_pointer: u64,
    pub return_address: u64,
    pub timestamp_ns: u64,
}

/// Exit from the innermost instrumented function of `tid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionExit {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
}

/// A function that could not be instrumented, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionThatFailedToBeInstrumented {
    pub function_id: u64,
    pub error_message: String,
}

// ============================================================================
// Interning
// ============================================================================

/// A string sent once and afterwards referenced by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternedString {
    pub key: u64,
    pub intern: String,
}

/// Identity of a kernel tracepoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TracepointInfo {
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternedTracepointInfo {
    pub key: u64,
    pub intern: TracepointInfo,
}

// ============================================================================
// GPU
// ============================================================================

/// Producer-side GPU job with its timeline name inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullGpuJob {
    pub pid: u32,
    pub tid: u32,
    pub context: u32,
    pub seqno: u32,
    pub depth: i32,
    pub amdgpu_cs_ioctl_time_ns: u64,
    pub amdgpu_sched_run_job_time_ns: u64,
    pub gpu_hardware_start_time_ns: u64,
    pub dma_fence_signaled_time_ns: u64,
    pub timeline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuJob {
    pub pid: u32,
    pub tid: u32,
    pub context: u32,
    pub seqno: u32,
    pub depth: i32,
    pub amdgpu_cs_ioctl_time_ns: u64,
    pub amdgpu_sched_run_job_time_ns: u64,
    pub gpu_hardware_start_time_ns: u64,
    pub dma_fence_signaled_time_ns: u64,
    pub timeline_key: u64,
}

/// A debug marker whose text is a producer-interned string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDebugMarker {
    pub text_key: u64,
    pub depth: i32,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuQueueSubmission {
    pub pid: u32,
    pub tid: u32,
    pub submit_timestamp_ns: u64,
    pub completed_markers: Vec<GpuDebugMarker>,
}

/// Frame presentation reported by the graphics stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentEvent {
    pub pid: u32,
    pub tid: u32,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
}

// ============================================================================
// Threads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadName {
    pub pid: u32,
    pub tid: u32,
    pub name: String,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNamesSnapshot {
    pub timestamp_ns: u64,
    pub thread_names: Vec<ThreadName>,
}

/// Scheduler state of a thread, as in `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreadState {
    #[default]
    Running,
    Runnable,
    InterruptibleSleep,
    UninterruptibleSleep,
    Stopped,
    Traced,
    Dead,
    Zombie,
    Parked,
    Idle,
}

/// Whether a thread state slice carries the callstack of its switch-out or wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreadStateSliceCallstackStatus {
    #[default]
    NoCallstack,
    /// Producer side only: a `ThreadStateSliceCallstack` was emitted for this slice
    WaitingForCallstack,
    CallstackSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStateSlice {
    pub pid: u32,
    pub tid: u32,
    pub thread_state: ThreadState,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    pub switch_out_or_wakeup_callstack_status: ThreadStateSliceCallstackStatus,
    pub switch_out_or_wakeup_callstack_id: u64,
}

impl ThreadStateSlice {
    /// Timestamp at which the slice began.
    #[must_use]
    pub fn begin_timestamp_ns(&self) -> u64 {
        self.end_timestamp_ns.saturating_sub(self.duration_ns)
    }
}

/// Callstack taken at the tracepoint that begins a thread state slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStateSliceCallstack {
    pub thread_state_slice_tid: u32,
    pub timestamp_ns: u64,
    pub callstack: Callstack,
}

// ============================================================================
// Symbols, Tracepoints and Modules
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullAddressInfo {
    pub absolute_address: u64,
    pub function_name: String,
    pub offset_in_function: u64,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub absolute_address: u64,
    pub function_name_key: u64,
    pub offset_in_function: u64,
    pub module_name_key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTracepointEvent {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub cpu: u32,
    pub tracepoint_info: TracepointInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracepointEvent {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub cpu: u32,
    pub tracepoint_info_key: u64,
}

/// A file mapped executable into the target's address space.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub file_path: String,
    pub file_size: u64,
    pub address_start: u64,
    pub address_end: u64,
    pub build_id: String,
    pub load_bias: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleUpdateEvent {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub module: ModuleInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesSnapshot {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub modules: Vec<ModuleInfo>,
}

// ============================================================================
// Memory
// ============================================================================

/// Host-wide memory counters from `/proc/meminfo`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemMemoryUsage {
    pub timestamp_ns: u64,
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessMemoryUsage {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsageEvent {
    pub timestamp_ns: u64,
    pub system_memory_usage: Option<SystemMemoryUsage>,
    pub process_memory_usage: Option<ProcessMemoryUsage>,
}

// ============================================================================
// Orbit API
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStart {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub name: String,
    pub color_rgba: u32,
    pub group_id: u64,
    pub address_in_function: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStop {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStartAsync {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub name: String,
    pub id: u64,
    pub color_rgba: u32,
    pub address_in_function: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStopAsync {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStringEvent {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub id: u64,
    pub name: String,
    pub color_rgba: u32,
    pub should_concatenate: bool,
}

/// A named numeric value plotted over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTrackValue<T> {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub name: String,
    pub color_rgba: u32,
    pub data: T,
}

pub type ApiTrackInt = ApiTrackValue<i32>;
pub type ApiTrackInt64 = ApiTrackValue<i64>;
pub type ApiTrackUint = ApiTrackValue<u32>;
pub type ApiTrackUint64 = ApiTrackValue<u64>;
pub type ApiTrackFloat = ApiTrackValue<f32>;
pub type ApiTrackDouble = ApiTrackValue<f64>;

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockResolutionEvent {
    pub timestamp_ns: u64,
    pub clock_resolution_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorsWithPerfEventOpenEvent {
    pub timestamp_ns: u64,
    pub failed_to_open: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnablingOrbitApiEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnablingUserSpaceInstrumentationEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningInstrumentingWithUprobesEvent {
    pub timestamp_ns: u64,
    pub functions_that_failed_to_instrument: Vec<FunctionThatFailedToBeInstrumented>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningInstrumentingWithUserSpaceInstrumentationEvent {
    pub timestamp_ns: u64,
    pub functions_that_failed_to_instrument: Vec<FunctionThatFailedToBeInstrumented>,
}

/// The kernel dropped records for `duration_ns` ending at `end_timestamp_ns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostPerfRecordsEvent {
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
}

/// Events older than the tracer's reordering window were discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfOrderEventsDiscardedEvent {
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
}
