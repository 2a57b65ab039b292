//! Tagged unions and framing messages of a capture stream.

use serde::{Deserialize, Serialize};

use crate::events::{
    AddressInfo, ApiScopeStart, ApiScopeStartAsync, ApiScopeStop, ApiScopeStopAsync,
    ApiStringEvent, ApiTrackDouble, ApiTrackFloat, ApiTrackInt, ApiTrackInt64, ApiTrackUint,
    ApiTrackUint64, CallstackSample, ClockResolutionEvent, ErrorEnablingOrbitApiEvent,
    ErrorEnablingUserSpaceInstrumentationEvent, ErrorsWithPerfEventOpenEvent, FullAddressInfo,
    FullCallstackSample, FullGpuJob, FullTracepointEvent, FunctionCall, FunctionEntry,
    FunctionExit, GpuJob, GpuQueueSubmission, InternedCallstack, InternedString,
    InternedTracepointInfo, LostPerfRecordsEvent, MemoryUsageEvent, ModuleUpdateEvent,
    ModulesSnapshot, OutOfOrderEventsDiscardedEvent, PresentEvent, SchedulingSlice, ThreadName,
    ThreadNamesSnapshot, ThreadStateSlice, ThreadStateSliceCallstack, TracepointEvent,
    WarningEvent, WarningInstrumentingWithUprobesEvent,
    WarningInstrumentingWithUserSpaceInstrumentationEvent,
};
use crate::options::CaptureOptions;

// ============================================================================
// Framing
// ============================================================================

/// First event of every capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureStarted {
    pub process_id: u32,
    pub executable_path: String,
    pub executable_build_id: String,
    /// Wall-clock start, for display only
    pub capture_start_unix_time_ns: u64,
    /// Monotonic start; precedes every other timestamp of the capture
    pub capture_start_timestamp_ns: u64,
    pub orbit_version_major: u32,
    pub orbit_version_minor: u32,
    pub capture_options: CaptureOptions,
}

/// Overall outcome of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureStatus {
    #[default]
    Successful,
    /// The service stopped the capture on its own (watchdog, duration cap)
    InterruptedByService,
    Failed,
}

/// State of the target process once the capture has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessState {
    #[default]
    Unknown,
    Running,
    Ended,
    Crashed,
    InternalError,
}

/// Signal that terminated the target process, when it crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TerminationSignal {
    #[default]
    Unspecified,
    InternalError,
    /// POSIX signal number in `1..=31`
    Signal(i32),
}

/// Last event of every capture; nothing follows it on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureFinished {
    pub status: CaptureStatus,
    /// Empty unless `status` is not `Successful`
    pub error_message: String,
    pub target_process_state: ProcessState,
    pub termination_signal: TerminationSignal,
}

// ============================================================================
// Orbit API Events
// ============================================================================

/// The subset of producer events generated through the Orbit API, whether by the
/// target process or by the service's own introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApiEvent {
    ScopeStart(ApiScopeStart),
    ScopeStop(ApiScopeStop),
    ScopeStartAsync(ApiScopeStartAsync),
    ScopeStopAsync(ApiScopeStopAsync),
    String(ApiStringEvent),
    TrackInt(ApiTrackInt),
    TrackInt64(ApiTrackInt64),
    TrackUint(ApiTrackUint),
    TrackUint64(ApiTrackUint64),
    TrackFloat(ApiTrackFloat),
    TrackDouble(ApiTrackDouble),
}

impl From<ApiEvent> for ProducerCaptureEvent {
    fn from(event: ApiEvent) -> Self {
        match event {
            ApiEvent::ScopeStart(e) => Self::ApiScopeStart(e),
            ApiEvent::ScopeStop(e) => Self::ApiScopeStop(e),
            ApiEvent::ScopeStartAsync(e) => Self::ApiScopeStartAsync(e),
            ApiEvent::ScopeStopAsync(e) => Self::ApiScopeStopAsync(e),
            ApiEvent::String(e) => Self::ApiStringEvent(e),
            ApiEvent::TrackInt(e) => Self::ApiTrackInt(e),
            ApiEvent::TrackInt64(e) => Self::ApiTrackInt64(e),
            ApiEvent::TrackUint(e) => Self::ApiTrackUint(e),
            ApiEvent::TrackUint64(e) => Self::ApiTrackUint64(e),
            ApiEvent::TrackFloat(e) => Self::ApiTrackFloat(e),
            ApiEvent::TrackDouble(e) => Self::ApiTrackDouble(e),
        }
    }
}

// ============================================================================
// Producer Side
// ============================================================================

/// Everything a producer may hand to the processor. Exactly one variant is set.
///
/// Variants prefixed with `Full` carry data inline that the client receives
/// interned; `FunctionEntry`/`FunctionExit` may be hijacked back into the kernel
/// tracer instead of being forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProducerCaptureEvent {
    AddressInfo(FullAddressInfo),
    ApiScopeStart(ApiScopeStart),
    ApiScopeStartAsync(ApiScopeStartAsync),
    ApiScopeStop(ApiScopeStop),
    ApiScopeStopAsync(ApiScopeStopAsync),
    ApiStringEvent(ApiStringEvent),
    ApiTrackDouble(ApiTrackDouble),
    ApiTrackFloat(ApiTrackFloat),
    ApiTrackInt(ApiTrackInt),
    ApiTrackInt64(ApiTrackInt64),
    ApiTrackUint(ApiTrackUint),
    ApiTrackUint64(ApiTrackUint64),
    CallstackSample(CallstackSample),
    CaptureFinished(CaptureFinished),
    CaptureStarted(CaptureStarted),
    ClockResolutionEvent(ClockResolutionEvent),
    ErrorEnablingOrbitApiEvent(ErrorEnablingOrbitApiEvent),
    ErrorEnablingUserSpaceInstrumentationEvent(ErrorEnablingUserSpaceInstrumentationEvent),
    ErrorsWithPerfEventOpenEvent(ErrorsWithPerfEventOpenEvent),
    FullCallstackSample(FullCallstackSample),
    FullGpuJob(FullGpuJob),
    FullTracepointEvent(FullTracepointEvent),
    FunctionCall(FunctionCall),
    FunctionEntry(FunctionEntry),
    FunctionExit(FunctionExit),
    GpuQueueSubmission(GpuQueueSubmission),
    InternedCallstack(InternedCallstack),
    InternedString(InternedString),
    LostPerfRecordsEvent(LostPerfRecordsEvent),
    MemoryUsageEvent(MemoryUsageEvent),
    ModuleUpdateEvent(ModuleUpdateEvent),
    ModulesSnapshot(ModulesSnapshot),
    OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent),
    PresentEvent(PresentEvent),
    SchedulingSlice(SchedulingSlice),
    ThreadName(ThreadName),
    ThreadNamesSnapshot(ThreadNamesSnapshot),
    ThreadStateSlice(ThreadStateSlice),
    ThreadStateSliceCallstack(ThreadStateSliceCallstack),
    WarningEvent(WarningEvent),
    WarningInstrumentingWithUprobesEvent(WarningInstrumentingWithUprobesEvent),
    WarningInstrumentingWithUserSpaceInstrumentationEvent(
        WarningInstrumentingWithUserSpaceInstrumentationEvent,
    ),
}

impl ProducerCaptureEvent {
    /// Variant name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddressInfo(_) => "AddressInfo",
            Self::ApiScopeStart(_) => "ApiScopeStart",
            Self::ApiScopeStartAsync(_) => "ApiScopeStartAsync",
            Self::ApiScopeStop(_) => "ApiScopeStop",
            Self::ApiScopeStopAsync(_) => "ApiScopeStopAsync",
            Self::ApiStringEvent(_) => "ApiStringEvent",
            Self::ApiTrackDouble(_) => "ApiTrackDouble",
            Self::ApiTrackFloat(_) => "ApiTrackFloat",
            Self::ApiTrackInt(_) => "ApiTrackInt",
            Self::ApiTrackInt64(_) => "ApiTrackInt64",
            Self::ApiTrackUint(_) => "ApiTrackUint",
            Self::ApiTrackUint64(_) => "ApiTrackUint64",
            Self::CallstackSample(_) => "CallstackSample",
            Self::CaptureFinished(_) => "CaptureFinished",
            Self::CaptureStarted(_) => "CaptureStarted",
            Self::ClockResolutionEvent(_) => "ClockResolutionEvent",
            Self::ErrorEnablingOrbitApiEvent(_) => "ErrorEnablingOrbitApiEvent",
            Self::ErrorEnablingUserSpaceInstrumentationEvent(_) => {
                "ErrorEnablingUserSpaceInstrumentationEvent"
            }
            Self::ErrorsWithPerfEventOpenEvent(_) => "ErrorsWithPerfEventOpenEvent",
            Self::FullCallstackSample(_) => "FullCallstackSample",
            Self::FullGpuJob(_) => "FullGpuJob",
            Self::FullTracepointEvent(_) => "FullTracepointEvent",
            Self::FunctionCall(_) => "FunctionCall",
            Self::FunctionEntry(_) => "FunctionEntry",
            Self::FunctionExit(_) => "FunctionExit",
            Self::GpuQueueSubmission(_) => "GpuQueueSubmission",
            Self::InternedCallstack(_) => "InternedCallstack",
            Self::InternedString(_) => "InternedString",
            Self::LostPerfRecordsEvent(_) => "LostPerfRecordsEvent",
            Self::MemoryUsageEvent(_) => "MemoryUsageEvent",
            Self::ModuleUpdateEvent(_) => "ModuleUpdateEvent",
            Self::ModulesSnapshot(_) => "ModulesSnapshot",
            Self::OutOfOrderEventsDiscardedEvent(_) => "OutOfOrderEventsDiscardedEvent",
            Self::PresentEvent(_) => "PresentEvent",
            Self::SchedulingSlice(_) => "SchedulingSlice",
            Self::ThreadName(_) => "ThreadName",
            Self::ThreadNamesSnapshot(_) => "ThreadNamesSnapshot",
            Self::ThreadStateSlice(_) => "ThreadStateSlice",
            Self::ThreadStateSliceCallstack(_) => "ThreadStateSliceCallstack",
            Self::WarningEvent(_) => "WarningEvent",
            Self::WarningInstrumentingWithUprobesEvent(_) => "WarningInstrumentingWithUprobesEvent",
            Self::WarningInstrumentingWithUserSpaceInstrumentationEvent(_) => {
                "WarningInstrumentingWithUserSpaceInstrumentationEvent"
            }
        }
    }
}

// ============================================================================
// Client Side
// ============================================================================

/// Everything the client may receive on the stream. Exactly one variant is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientCaptureEvent {
    AddressInfo(AddressInfo),
    ApiScopeStart(ApiScopeStart),
    ApiScopeStartAsync(ApiScopeStartAsync),
    ApiScopeStop(ApiScopeStop),
    ApiScopeStopAsync(ApiScopeStopAsync),
    ApiStringEvent(ApiStringEvent),
    ApiTrackDouble(ApiTrackDouble),
    ApiTrackFloat(ApiTrackFloat),
    ApiTrackInt(ApiTrackInt),
    ApiTrackInt64(ApiTrackInt64),
    ApiTrackUint(ApiTrackUint),
    ApiTrackUint64(ApiTrackUint64),
    CallstackSample(CallstackSample),
    CaptureFinished(CaptureFinished),
    CaptureStarted(CaptureStarted),
    ClockResolutionEvent(ClockResolutionEvent),
    ErrorEnablingOrbitApiEvent(ErrorEnablingOrbitApiEvent),
    ErrorEnablingUserSpaceInstrumentationEvent(ErrorEnablingUserSpaceInstrumentationEvent),
    ErrorsWithPerfEventOpenEvent(ErrorsWithPerfEventOpenEvent),
    FunctionCall(FunctionCall),
    GpuJob(GpuJob),
    GpuQueueSubmission(GpuQueueSubmission),
    InternedCallstack(InternedCallstack),
    InternedString(InternedString),
    InternedTracepointInfo(InternedTracepointInfo),
    LostPerfRecordsEvent(LostPerfRecordsEvent),
    MemoryUsageEvent(MemoryUsageEvent),
    ModuleUpdateEvent(ModuleUpdateEvent),
    ModulesSnapshot(ModulesSnapshot),
    OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent),
    PresentEvent(PresentEvent),
    SchedulingSlice(SchedulingSlice),
    ThreadName(ThreadName),
    ThreadNamesSnapshot(ThreadNamesSnapshot),
    ThreadStateSlice(ThreadStateSlice),
    TracepointEvent(TracepointEvent),
    WarningEvent(WarningEvent),
    WarningInstrumentingWithUprobesEvent(WarningInstrumentingWithUprobesEvent),
    WarningInstrumentingWithUserSpaceInstrumentationEvent(
        WarningInstrumentingWithUserSpaceInstrumentationEvent,
    ),
}

impl ClientCaptureEvent {
    #[must_use]
    pub fn is_capture_started(&self) -> bool {
        matches!(self, Self::CaptureStarted(_))
    }

    #[must_use]
    pub fn is_capture_finished(&self) -> bool {
        matches!(self, Self::CaptureFinished(_))
    }
}

// ============================================================================
// Stream Messages
// ============================================================================

/// Client-to-service message; the first one starts the capture.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub capture_options: CaptureOptions,
}

/// Service-to-client batch of events, in production order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub capture_events: Vec<ClientCaptureEvent>,
}

impl CaptureResponse {
    #[must_use]
    pub fn capture_events_size(&self) -> usize {
        self.capture_events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ApiScopeStop;

    #[test]
    fn test_api_event_converts_to_matching_variant() {
        let stop = ApiScopeStop { pid: 1, tid: 2, timestamp_ns: 3 };
        let event: ProducerCaptureEvent = ApiEvent::ScopeStop(stop.clone()).into();
        assert_eq!(event, ProducerCaptureEvent::ApiScopeStop(stop));
        assert_eq!(event.name(), "ApiScopeStop");
    }

    #[test]
    fn test_capture_finished_defaults_to_success() {
        let finished = CaptureFinished::default();
        assert_eq!(finished.status, CaptureStatus::Successful);
        assert!(finished.error_message.is_empty());
        assert_eq!(finished.termination_signal, TerminationSignal::Unspecified);
    }

    #[test]
    fn test_framing_predicates() {
        let finished = ClientCaptureEvent::CaptureFinished(CaptureFinished::default());
        assert!(finished.is_capture_finished());
        assert!(!finished.is_capture_started());
    }
}
