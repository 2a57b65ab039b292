//! Per-capture configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How dynamically instrumented functions are hooked in the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DynamicInstrumentationMethod {
    /// Kernel uprobes/uretprobes, handled entirely by the kernel tracer.
    #[default]
    Uprobes,
    /// Trampolines installed in the target's address space.
    UserSpaceInstrumentation,
}

/// Stack unwinding strategy for callstack samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnwindingMethod {
    #[default]
    Dwarf,
    FramePointers,
}

/// A function the client asked to instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentedFunction {
    /// Client-assigned id, echoed back in `FunctionCall` events
    pub function_id: u64,
    /// Absolute virtual address, or offset into `module_path` for uprobes
    pub absolute_address_or_offset: u64,
    /// Path of the module containing the function
    pub module_path: String,
    /// Demangled name, informational only
    pub function_name: String,
}

/// Immutable configuration of one capture.
///
/// Constructed by the client, sent in the first `CaptureRequest` and never modified
/// afterwards. The service derives a filtered copy for the kernel tracer when some
/// functions are handled by user-space instrumentation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Target process id
    pub pid: u32,
    /// Enable the Orbit API probes inside the target
    pub enable_api: bool,
    pub dynamic_instrumentation_method: DynamicInstrumentationMethod,
    pub instrumented_functions: Vec<InstrumentedFunction>,
    /// Report the service's own scopes as API events
    pub enable_introspection: bool,
    /// Memory sampling period; zero disables memory sampling
    pub memory_sampling_period_ns: u64,
    /// Optional upper bound on the capture length
    pub max_capture_duration_ns: Option<u64>,
    /// Callstack sampling frequency; zero disables sampling
    pub samples_per_second: f64,
    pub unwinding_method: UnwindingMethod,
    pub trace_thread_state: bool,
    pub trace_gpu_driver: bool,
}

impl CaptureOptions {
    /// Create options for `pid` with everything else disabled.
    #[must_use]
    pub fn for_pid(pid: u32) -> Self {
        Self { pid, ..Self::default() }
    }

    /// Maximum capture duration, if the client asked for one.
    #[must_use]
    pub fn max_capture_duration(&self) -> Option<Duration> {
        self.max_capture_duration_ns.map(Duration::from_nanos)
    }

    /// Memory sampling period, if memory sampling is enabled.
    #[must_use]
    pub fn memory_sampling_period(&self) -> Option<Duration> {
        (self.memory_sampling_period_ns > 0)
            .then(|| Duration::from_nanos(self.memory_sampling_period_ns))
    }

    /// True when trampolines have to be installed for this capture.
    #[must_use]
    pub fn uses_user_space_instrumentation(&self) -> bool {
        self.dynamic_instrumentation_method == DynamicInstrumentationMethod::UserSpaceInstrumentation
            && !self.instrumented_functions.is_empty()
    }
}
