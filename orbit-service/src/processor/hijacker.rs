//! Redirects user-space instrumentation entry/exit events into the tracer.
//!
//! `FunctionEntry`/`FunctionExit` events produced by trampolines are paired
//! into `FunctionCall`s by the tracer, interleaved with its own uprobes
//! events, instead of being forwarded to the client unpaired.

use super::ProducerEventProcessor;
use orbit_protos::{FunctionEntry, FunctionExit, ProducerCaptureEvent};
use std::sync::Arc;

/// Something that can integrate entry/exit events into its own event stream.
pub trait FunctionEntryExitSink: Send + Sync {
    fn process_function_entry(&self, entry: FunctionEntry);
    fn process_function_exit(&self, exit: FunctionExit);
}

/// Pass-through processor that diverts `FunctionEntry` and `FunctionExit`.
pub struct FunctionEntryExitHijacker {
    inner: Arc<dyn ProducerEventProcessor>,
    sink: Arc<dyn FunctionEntryExitSink>,
}

impl FunctionEntryExitHijacker {
    pub fn new(inner: Arc<dyn ProducerEventProcessor>, sink: Arc<dyn FunctionEntryExitSink>) -> Self {
        Self { inner, sink }
    }
}

impl ProducerEventProcessor for FunctionEntryExitHijacker {
    fn process_event(&self, producer_id: u64, event: ProducerCaptureEvent) {
        match event {
            ProducerCaptureEvent::FunctionEntry(entry) => self.sink.process_function_entry(entry),
            ProducerCaptureEvent::FunctionExit(exit) => self.sink.process_function_exit(exit),
            other => self.inner.process_event(producer_id, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_protos::{WarningEvent, USER_SPACE_INSTRUMENTATION_PRODUCER_ID};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        forwarded: Mutex<Vec<(u64, &'static str)>>,
        hijacked: Mutex<Vec<&'static str>>,
    }

    impl ProducerEventProcessor for Recorder {
        fn process_event(&self, producer_id: u64, event: ProducerCaptureEvent) {
            self.forwarded.lock().unwrap().push((producer_id, event.name()));
        }
    }

    impl FunctionEntryExitSink for Recorder {
        fn process_function_entry(&self, _entry: FunctionEntry) {
            self.hijacked.lock().unwrap().push("entry");
        }

        fn process_function_exit(&self, _exit: FunctionExit) {
            self.hijacked.lock().unwrap().push("exit");
        }
    }

    #[test]
    fn test_entry_exit_diverted_everything_else_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let hijacker = FunctionEntryExitHijacker::new(recorder.clone(), recorder.clone());
        let producer = USER_SPACE_INSTRUMENTATION_PRODUCER_ID;

        hijacker.process_event(
            producer,
            ProducerCaptureEvent::FunctionEntry(FunctionEntry {
                pid: 1,
                tid: 2,
                function_id: 3,
                stack_pointer: 0x7fff_0000,
                return_address: 0x4000,
                timestamp_ns: 10,
            }),
        );
        hijacker.process_event(
            producer,
            ProducerCaptureEvent::WarningEvent(WarningEvent { timestamp_ns: 11, message: "w".into() }),
        );
        hijacker.process_event(
            producer,
            ProducerCaptureEvent::FunctionExit(FunctionExit { pid: 1, tid: 2, timestamp_ns: 12 }),
        );

        assert_eq!(*recorder.hijacked.lock().unwrap(), vec!["entry", "exit"]);
        assert_eq!(*recorder.forwarded.lock().unwrap(), vec![(producer, "WarningEvent")]);
    }
}
