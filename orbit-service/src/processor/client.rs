//! Converts producer events into client events and interns repeated data.

use super::intern::InternPool;
use super::ProducerEventProcessor;
use crate::collector::ClientCaptureEventCollector;
use log::error;
use orbit_protos::{
    AddressInfo, Callstack, CallstackSample, ClientCaptureEvent, FullAddressInfo,
    FullCallstackSample, FullGpuJob, FullTracepointEvent, GpuJob, GpuQueueSubmission,
    InternedCallstack, InternedString, InternedTracepointInfo, ProducerCaptureEvent,
    ThreadStateSlice, ThreadStateSliceCallstack, ThreadStateSliceCallstackStatus, TracepointEvent,
    TracepointInfo,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ProcessorState {
    callstack_pool: InternPool<Callstack>,
    string_pool: InternPool<String>,
    tracepoint_pool: InternPool<TracepointInfo>,
    /// (producer id, producer callstack key) -> client callstack id
    producer_callstack_ids: HashMap<(u64, u64), u64>,
    /// (producer id, producer string key) -> client string id
    producer_string_ids: HashMap<(u64, u64), u64>,
    /// (tid, slice begin timestamp) -> client callstack id
    thread_state_slice_callstacks: HashMap<(u32, u64), u64>,
}

/// The processor every producer publishes into.
///
/// Pass-through events go straight to the collector. Events that touch the
/// intern tables are converted while holding the state lock, so an interned
/// value always reaches the collector before the first event referencing it.
pub struct InterningEventProcessor {
    collector: Arc<dyn ClientCaptureEventCollector>,
    state: Mutex<ProcessorState>,
}

impl InterningEventProcessor {
    pub fn new(collector: Arc<dyn ClientCaptureEventCollector>) -> Self {
        Self { collector, state: Mutex::new(ProcessorState::default()) }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn intern_string(&self, state: &mut ProcessorState, value: &str) -> u64 {
        let (key, assigned) = state.string_pool.get_or_assign_id(value);
        if assigned {
            self.collector.add_event(ClientCaptureEvent::InternedString(InternedString {
                key,
                intern: value.to_owned(),
            }));
        }
        key
    }

    fn intern_callstack(&self, state: &mut ProcessorState, callstack: Callstack) -> u64 {
        let (key, assigned) = state.callstack_pool.get_or_assign_id(&callstack);
        if assigned {
            self.collector.add_event(ClientCaptureEvent::InternedCallstack(InternedCallstack {
                key,
                intern: callstack,
            }));
        }
        key
    }

    fn process_full_callstack_sample(&self, sample: FullCallstackSample) {
        let mut state = self.lock_state();
        let callstack_id = self.intern_callstack(&mut state, sample.callstack);
        self.collector.add_event(ClientCaptureEvent::CallstackSample(CallstackSample {
            pid: sample.pid,
            tid: sample.tid,
            timestamp_ns: sample.timestamp_ns,
            callstack_id,
        }));
    }

    fn process_full_address_info(&self, info: FullAddressInfo) {
        let mut state = self.lock_state();
        let function_name_key = self.intern_string(&mut state, &info.function_name);
        let module_name_key = self.intern_string(&mut state, &info.module_name);
        self.collector.add_event(ClientCaptureEvent::AddressInfo(AddressInfo {
            absolute_address: info.absolute_address,
            function_name_key,
            offset_in_function: info.offset_in_function,
            module_name_key,
        }));
    }

    fn process_full_gpu_job(&self, job: FullGpuJob) {
        let mut state = self.lock_state();
        let timeline_key = self.intern_string(&mut state, &job.timeline);
        self.collector.add_event(ClientCaptureEvent::GpuJob(GpuJob {
            pid: job.pid,
            tid: job.tid,
            context: job.context,
            seqno: job.seqno,
            depth: job.depth,
            amdgpu_cs_ioctl_time_ns: job.amdgpu_cs_ioctl_time_ns,
            amdgpu_sched_run_job_time_ns: job.amdgpu_sched_run_job_time_ns,
            gpu_hardware_start_time_ns: job.gpu_hardware_start_time_ns,
            dma_fence_signaled_time_ns: job.dma_fence_signaled_time_ns,
            timeline_key,
        }));
    }

    fn process_full_tracepoint_event(&self, event: FullTracepointEvent) {
        let mut state = self.lock_state();
        let (key, assigned) = state.tracepoint_pool.get_or_assign_id(&event.tracepoint_info);
        if assigned {
            self.collector.add_event(ClientCaptureEvent::InternedTracepointInfo(
                InternedTracepointInfo { key, intern: event.tracepoint_info },
            ));
        }
        self.collector.add_event(ClientCaptureEvent::TracepointEvent(TracepointEvent {
            pid: event.pid,
            tid: event.tid,
            timestamp_ns: event.timestamp_ns,
            cpu: event.cpu,
            tracepoint_info_key: key,
        }));
    }

    fn process_interned_callstack(&self, producer_id: u64, interned: InternedCallstack) {
        let mut state = self.lock_state();
        if state.producer_callstack_ids.contains_key(&(producer_id, interned.key)) {
            error!("Producer {producer_id} interned callstack key {} twice", interned.key);
        }
        let client_id = self.intern_callstack(&mut state, interned.intern);
        state.producer_callstack_ids.insert((producer_id, interned.key), client_id);
    }

    fn process_interned_string(&self, producer_id: u64, interned: InternedString) {
        let mut state = self.lock_state();
        if state.producer_string_ids.contains_key(&(producer_id, interned.key)) {
            error!("Producer {producer_id} interned string key {} twice", interned.key);
        }
        let client_id = self.intern_string(&mut state, &interned.intern);
        state.producer_string_ids.insert((producer_id, interned.key), client_id);
    }

    fn process_callstack_sample(&self, producer_id: u64, mut sample: CallstackSample) {
        let state = self.lock_state();
        let Some(&client_id) = state.producer_callstack_ids.get(&(producer_id, sample.callstack_id))
        else {
            error!(
                "Dropping CallstackSample from producer {producer_id}: unknown callstack key {}",
                sample.callstack_id
            );
            return;
        };
        sample.callstack_id = client_id;
        self.collector.add_event(ClientCaptureEvent::CallstackSample(sample));
    }

    fn process_gpu_queue_submission(&self, producer_id: u64, mut submission: GpuQueueSubmission) {
        let state = self.lock_state();
        for marker in &mut submission.completed_markers {
            let Some(&client_id) = state.producer_string_ids.get(&(producer_id, marker.text_key))
            else {
                error!(
                    "Dropping GpuQueueSubmission from producer {producer_id}: unknown string key {}",
                    marker.text_key
                );
                return;
            };
            marker.text_key = client_id;
        }
        self.collector.add_event(ClientCaptureEvent::GpuQueueSubmission(submission));
    }

    fn process_thread_state_slice_callstack(&self, slice_callstack: ThreadStateSliceCallstack) {
        let mut state = self.lock_state();
        let callstack_id = self.intern_callstack(&mut state, slice_callstack.callstack);
        // The callstack is taken at the slice's begin, so it always arrives before the slice.
        state.thread_state_slice_callstacks.insert(
            (slice_callstack.thread_state_slice_tid, slice_callstack.timestamp_ns),
            callstack_id,
        );
    }

    fn process_thread_state_slice(&self, mut slice: ThreadStateSlice) {
        match slice.switch_out_or_wakeup_callstack_status {
            ThreadStateSliceCallstackStatus::NoCallstack => {}
            ThreadStateSliceCallstackStatus::CallstackSet => {
                error!("ThreadStateSlice for tid {} already has a callstack set", slice.tid);
            }
            ThreadStateSliceCallstackStatus::WaitingForCallstack => {
                let mut state = self.lock_state();
                let key = (slice.tid, slice.begin_timestamp_ns());
                if let Some(callstack_id) = state.thread_state_slice_callstacks.remove(&key) {
                    slice.switch_out_or_wakeup_callstack_status =
                        ThreadStateSliceCallstackStatus::CallstackSet;
                    slice.switch_out_or_wakeup_callstack_id = callstack_id;
                } else {
                    // Unwinding can fail completely; the slice is kept without a callstack.
                    error!("Missing callstack for thread state slice waiting for it");
                    slice.switch_out_or_wakeup_callstack_status =
                        ThreadStateSliceCallstackStatus::NoCallstack;
                    slice.switch_out_or_wakeup_callstack_id = 0;
                }
            }
        }
        self.collector.add_event(ClientCaptureEvent::ThreadStateSlice(slice));
    }

    fn check_no_pending_slice_callstacks(&self) {
        let state = self.lock_state();
        if !state.thread_state_slice_callstacks.is_empty() {
            error!(
                "{} saved callstacks for thread state slices were not merged into any slice \
                 before the capture finished",
                state.thread_state_slice_callstacks.len()
            );
        }
    }
}

impl ProducerEventProcessor for InterningEventProcessor {
    fn process_event(&self, producer_id: u64, event: ProducerCaptureEvent) {
        use ClientCaptureEvent as C;
        use ProducerCaptureEvent as P;

        let client_event = match event {
            P::AddressInfo(e) => return self.process_full_address_info(e),
            P::CallstackSample(e) => return self.process_callstack_sample(producer_id, e),
            P::FullCallstackSample(e) => return self.process_full_callstack_sample(e),
            P::FullGpuJob(e) => return self.process_full_gpu_job(e),
            P::FullTracepointEvent(e) => return self.process_full_tracepoint_event(e),
            P::GpuQueueSubmission(e) => return self.process_gpu_queue_submission(producer_id, e),
            P::InternedCallstack(e) => return self.process_interned_callstack(producer_id, e),
            P::InternedString(e) => return self.process_interned_string(producer_id, e),
            P::ThreadStateSlice(e) => return self.process_thread_state_slice(e),
            P::ThreadStateSliceCallstack(e) => return self.process_thread_state_slice_callstack(e),
            P::FunctionEntry(_) => return log_unhijacked("FunctionEntry", producer_id),
            P::FunctionExit(_) => return log_unhijacked("FunctionExit", producer_id),
            P::CaptureFinished(e) => {
                self.check_no_pending_slice_callstacks();
                C::CaptureFinished(e)
            }
            P::ApiScopeStart(e) => C::ApiScopeStart(e),
            P::ApiScopeStartAsync(e) => C::ApiScopeStartAsync(e),
            P::ApiScopeStop(e) => C::ApiScopeStop(e),
            P::ApiScopeStopAsync(e) => C::ApiScopeStopAsync(e),
            P::ApiStringEvent(e) => C::ApiStringEvent(e),
            P::ApiTrackDouble(e) => C::ApiTrackDouble(e),
            P::ApiTrackFloat(e) => C::ApiTrackFloat(e),
            P::ApiTrackInt(e) => C::ApiTrackInt(e),
            P::ApiTrackInt64(e) => C::ApiTrackInt64(e),
            P::ApiTrackUint(e) => C::ApiTrackUint(e),
            P::ApiTrackUint64(e) => C::ApiTrackUint64(e),
            P::CaptureStarted(e) => C::CaptureStarted(e),
            P::ClockResolutionEvent(e) => C::ClockResolutionEvent(e),
            P::ErrorEnablingOrbitApiEvent(e) => C::ErrorEnablingOrbitApiEvent(e),
            P::ErrorEnablingUserSpaceInstrumentationEvent(e) => {
                C::ErrorEnablingUserSpaceInstrumentationEvent(e)
            }
            P::ErrorsWithPerfEventOpenEvent(e) => C::ErrorsWithPerfEventOpenEvent(e),
            P::FunctionCall(e) => C::FunctionCall(e),
            P::LostPerfRecordsEvent(e) => C::LostPerfRecordsEvent(e),
            P::MemoryUsageEvent(e) => C::MemoryUsageEvent(e),
            P::ModuleUpdateEvent(e) => C::ModuleUpdateEvent(e),
            P::ModulesSnapshot(e) => C::ModulesSnapshot(e),
            P::OutOfOrderEventsDiscardedEvent(e) => C::OutOfOrderEventsDiscardedEvent(e),
            P::PresentEvent(e) => C::PresentEvent(e),
            P::SchedulingSlice(e) => C::SchedulingSlice(e),
            P::ThreadName(e) => C::ThreadName(e),
            P::ThreadNamesSnapshot(e) => C::ThreadNamesSnapshot(e),
            P::WarningEvent(e) => C::WarningEvent(e),
            P::WarningInstrumentingWithUprobesEvent(e) => C::WarningInstrumentingWithUprobesEvent(e),
            P::WarningInstrumentingWithUserSpaceInstrumentationEvent(e) => {
                C::WarningInstrumentingWithUserSpaceInstrumentationEvent(e)
            }
        };
        self.collector.add_event(client_event);
    }
}

fn log_unhijacked(kind: &str, producer_id: u64) {
    error!("{kind} from producer {producer_id} reached the processor without a tracer; dropping it");
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_protos::{
        CallstackType, GpuDebugMarker, SchedulingSlice, ThreadState, LINUX_TRACING_PRODUCER_ID,
        USER_SPACE_INSTRUMENTATION_PRODUCER_ID,
    };

    #[derive(Default)]
    struct VecCollector {
        events: Mutex<Vec<ClientCaptureEvent>>,
    }

    impl ClientCaptureEventCollector for VecCollector {
        fn add_event(&self, event: ClientCaptureEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn stop_and_wait(&self) {}
    }

    fn processor() -> (InterningEventProcessor, Arc<VecCollector>) {
        let collector = Arc::new(VecCollector::default());
        (InterningEventProcessor::new(collector.clone()), collector)
    }

    fn callstack(pcs: &[u64]) -> Callstack {
        Callstack { pcs: pcs.to_vec(), callstack_type: CallstackType::Complete }
    }

    fn slice(tid: u32, end: u64, duration: u64) -> ThreadStateSlice {
        ThreadStateSlice {
            pid: 1,
            tid,
            thread_state: ThreadState::InterruptibleSleep,
            duration_ns: duration,
            end_timestamp_ns: end,
            switch_out_or_wakeup_callstack_status:
                ThreadStateSliceCallstackStatus::WaitingForCallstack,
            switch_out_or_wakeup_callstack_id: 0,
        }
    }

    #[test]
    fn test_pass_through_keeps_order() {
        let (processor, collector) = processor();
        for i in 0..3 {
            processor.process_event(
                LINUX_TRACING_PRODUCER_ID,
                ProducerCaptureEvent::SchedulingSlice(SchedulingSlice {
                    pid: 1,
                    tid: 2,
                    core: 0,
                    duration_ns: 10,
                    out_timestamp_ns: i,
                }),
            );
        }
        let events = collector.events.lock().unwrap();
        let timestamps: Vec<u64> = events
            .iter()
            .map(|e| match e {
                ClientCaptureEvent::SchedulingSlice(s) => s.out_timestamp_ns,
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(timestamps, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_callstack_sample_interned_once() {
        let (processor, collector) = processor();
        for timestamp_ns in [10, 20] {
            processor.process_event(
                LINUX_TRACING_PRODUCER_ID,
                ProducerCaptureEvent::FullCallstackSample(FullCallstackSample {
                    pid: 1,
                    tid: 2,
                    timestamp_ns,
                    callstack: callstack(&[0x10, 0x20]),
                }),
            );
        }
        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ClientCaptureEvent::InternedCallstack(c) if c.key == 1));
        assert!(matches!(&events[1], ClientCaptureEvent::CallstackSample(s) if s.callstack_id == 1));
        assert!(matches!(&events[2], ClientCaptureEvent::CallstackSample(s) if s.callstack_id == 1));
    }

    #[test]
    fn test_producer_keys_are_remapped_per_producer() {
        let (processor, collector) = processor();
        processor.process_event(
            USER_SPACE_INSTRUMENTATION_PRODUCER_ID,
            ProducerCaptureEvent::InternedString(InternedString { key: 7, intern: "x".into() }),
        );
        processor.process_event(
            1000,
            ProducerCaptureEvent::InternedString(InternedString { key: 3, intern: "x".into() }),
        );
        processor.process_event(
            1000,
            ProducerCaptureEvent::GpuQueueSubmission(GpuQueueSubmission {
                pid: 1,
                tid: 1,
                submit_timestamp_ns: 5,
                completed_markers: vec![GpuDebugMarker {
                    text_key: 3,
                    depth: 0,
                    begin_timestamp_ns: 1,
                    end_timestamp_ns: 2,
                }],
            }),
        );

        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ClientCaptureEvent::InternedString(s) if s.key == 1));
        match &events[1] {
            ClientCaptureEvent::GpuQueueSubmission(s) => {
                assert_eq!(s.completed_markers[0].text_key, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_callstack_key_is_dropped() {
        let (processor, collector) = processor();
        processor.process_event(
            1000,
            ProducerCaptureEvent::CallstackSample(CallstackSample {
                pid: 1,
                tid: 1,
                timestamp_ns: 1,
                callstack_id: 42,
            }),
        );
        assert!(collector.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_thread_state_slice_merged_with_callstack() {
        let (processor, collector) = processor();
        processor.process_event(
            LINUX_TRACING_PRODUCER_ID,
            ProducerCaptureEvent::ThreadStateSliceCallstack(ThreadStateSliceCallstack {
                thread_state_slice_tid: 5,
                timestamp_ns: 700,
                callstack: callstack(&[1, 2, 3]),
            }),
        );
        processor.process_event(
            LINUX_TRACING_PRODUCER_ID,
            ProducerCaptureEvent::ThreadStateSlice(slice(5, 1000, 300)),
        );
        processor.process_event(
            LINUX_TRACING_PRODUCER_ID,
            ProducerCaptureEvent::ThreadStateSlice(slice(5, 2000, 300)),
        );

        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        match (&events[1], &events[2]) {
            (ClientCaptureEvent::ThreadStateSlice(merged), ClientCaptureEvent::ThreadStateSlice(missing)) => {
                assert_eq!(
                    merged.switch_out_or_wakeup_callstack_status,
                    ThreadStateSliceCallstackStatus::CallstackSet
                );
                assert_eq!(merged.switch_out_or_wakeup_callstack_id, 1);
                assert_eq!(
                    missing.switch_out_or_wakeup_callstack_status,
                    ThreadStateSliceCallstackStatus::NoCallstack
                );
                assert_eq!(missing.switch_out_or_wakeup_callstack_id, 0);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_full_address_info_interns_names() {
        let (processor, collector) = processor();
        for absolute_address in [0x100, 0x200] {
            processor.process_event(
                LINUX_TRACING_PRODUCER_ID,
                ProducerCaptureEvent::AddressInfo(FullAddressInfo {
                    absolute_address,
                    function_name: "main".into(),
                    offset_in_function: 0,
                    module_name: "/bin/app".into(),
                }),
            );
        }
        let events = collector.events.lock().unwrap();
        // Two interned strings, then two address infos sharing their keys.
        assert_eq!(events.len(), 4);
        match &events[3] {
            ClientCaptureEvent::AddressInfo(info) => {
                assert_eq!(info.function_name_key, 1);
                assert_eq!(info.module_name_key, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
