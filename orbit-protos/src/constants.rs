//! Reserved producer ids.
//!
//! Every event handed to the processor is tagged with the id of the producer that
//! generated it. Producer-local intern keys are only unique per producer id.

/// Framing events generated by the capture service itself.
pub const ROOT_PRODUCER_ID: u64 = 0;

/// Kernel tracing on Linux (`perf_event_open`, uprobes, tracepoints).
pub const LINUX_TRACING_PRODUCER_ID: u64 = 1;

/// Periodic system and process memory sampling.
pub const MEMORY_INFO_PRODUCER_ID: u64 = 2;

/// The service's own instrumentation.
pub const INTROSPECTION_PRODUCER_ID: u64 = 3;

/// Event Tracing for Windows.
pub const WINDOWS_TRACING_PRODUCER_ID: u64 = 4;

/// Entry/exit events from trampolines installed in the target process.
pub const USER_SPACE_INSTRUMENTATION_PRODUCER_ID: u64 = 5;

/// First id handed out to producers that connect from outside the service.
pub const EXTERNAL_PRODUCER_START_ID: u64 = 1000;

/// Returns true for the ids the service reserves for itself.
#[must_use]
pub fn is_reserved_producer_id(producer_id: u64) -> bool {
    producer_id < EXTERNAL_PRODUCER_START_ID
}
