//! Double-buffered collector that streams batches on a dedicated sender thread.
//!
//! ## Buffering
//!
//! ```text
//! add_event ──▶ building arena ─┐ swap under lock
//!                                ▼
//!               to-send arena ──▶ writer.write(batch) ... (no lock held)
//!                                │
//!                                └─ reset(): event buffers kept for reuse
//! ```
//!
//! The sender swaps the arenas when the current batch reaches the flush
//! threshold, when a second batch has been started, when the flush interval
//! elapses, or when a stop was requested.

use super::{ClientCaptureEventCollector, CollectorConfig};
use crate::domain::{ErrorMessage, TransportError};
use crate::transport::CaptureResponseWriter;
use log::{debug, error, info};
use orbit_protos::{CaptureResponse, ClientCaptureEvent};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Running totals of everything written by one collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub events: u64,
    pub responses: u64,
    pub bytes: u64,
}

/// Reusable list of batches.
///
/// Cleared event vectors are kept in `spare` so that steady-state batching
/// allocates nothing.
#[derive(Default)]
struct ResponseArena {
    responses: Vec<CaptureResponse>,
    spare: Vec<Vec<ClientCaptureEvent>>,
}

impl ResponseArena {
    fn push(&mut self, event: ClientCaptureEvent, max_events_per_response: usize) {
        let needs_new_batch = self
            .responses
            .last()
            .is_none_or(|r| r.capture_events.len() >= max_events_per_response);
        if needs_new_batch {
            let capture_events = self
                .spare
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(max_events_per_response));
            self.responses.push(CaptureResponse { capture_events });
        }
        if let Some(current) = self.responses.last_mut() {
            current.capture_events.push(event);
        }
    }

    fn current_batch_len(&self) -> usize {
        self.responses.last().map_or(0, CaptureResponse::capture_events_size)
    }

    fn batch_count(&self) -> usize {
        self.responses.len()
    }

    fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    fn reset(&mut self) {
        for mut response in self.responses.drain(..) {
            response.capture_events.clear();
            self.spare.push(response.capture_events);
        }
    }
}

struct CollectorState {
    building: ResponseArena,
    stop_requested: bool,
    accepting: bool,
    sender_finished: bool,
}

impl CollectorState {
    fn should_flush(&self, config: &CollectorConfig) -> bool {
        self.stop_requested
            || self.building.batch_count() > 1
            || self.building.current_batch_len() >= config.flush_event_count_threshold
    }
}

struct Shared {
    config: CollectorConfig,
    state: Mutex<CollectorState>,
    wake: Condvar,
    finished: Condvar,
    stats: Mutex<CollectorStats>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_batch(&self, events: usize, bytes: usize) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.events += events as u64;
        stats.responses += 1;
        stats.bytes += bytes as u64;
        debug!(
            "Sent CaptureResponse with {events} events ({bytes} bytes), totals: {} events, {} responses",
            stats.events, stats.responses
        );
    }
}

/// Collector writing batches to a [`CaptureResponseWriter`] from its own thread.
pub struct StreamClientCaptureEventCollector {
    shared: Arc<Shared>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClientCaptureEventCollector {
    /// Start a collector with the default batching parameters.
    pub fn new(writer: Box<dyn CaptureResponseWriter>) -> Self {
        Self::start(writer, CollectorConfig::default())
    }

    /// Start a collector with custom batching parameters.
    ///
    /// # Errors
    /// Returns an [`ErrorMessage`] if `config` is inconsistent.
    pub fn with_config(
        writer: Box<dyn CaptureResponseWriter>,
        config: CollectorConfig,
    ) -> Result<Self, ErrorMessage> {
        config.validate()?;
        Ok(Self::start(writer, config))
    }

    fn start(writer: Box<dyn CaptureResponseWriter>, config: CollectorConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(CollectorState {
                building: ResponseArena::default(),
                stop_requested: false,
                accepting: true,
                sender_finished: false,
            }),
            wake: Condvar::new(),
            finished: Condvar::new(),
            stats: Mutex::new(CollectorStats::default()),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || sender_loop(&thread_shared, writer));
        Self { shared, sender: Mutex::new(Some(handle)) }
    }

    /// Totals written so far.
    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        *self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientCaptureEventCollector for StreamClientCaptureEventCollector {
    fn add_event(&self, event: ClientCaptureEvent) {
        let mut state = self.shared.lock_state();
        if !state.accepting {
            return;
        }
        state.building.push(event, self.shared.config.max_events_per_response);
        if state.should_flush(&self.shared.config) {
            self.shared.wake.notify_one();
        }
    }

    fn stop_and_wait(&self) {
        let handle = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            // Another caller owns the join; wait for it to finish flushing.
            let state = self.shared.lock_state();
            let _finished = self
                .shared
                .finished
                .wait_while(state, |s| !s.sender_finished)
                .unwrap_or_else(PoisonError::into_inner);
            return;
        };
        {
            let mut state = self.shared.lock_state();
            state.stop_requested = true;
            state.accepting = false;
        }
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            error!("Capture event sender thread panicked");
        }
        self.shared.lock_state().sender_finished = true;
        self.shared.finished.notify_all();
        let stats = self.stats();
        info!(
            "Finished sending capture: {} events in {} responses ({} bytes)",
            stats.events, stats.responses, stats.bytes
        );
    }
}

impl Drop for StreamClientCaptureEventCollector {
    fn drop(&mut self) {
        self.stop_and_wait();
    }
}

fn sender_loop(shared: &Shared, mut writer: Box<dyn CaptureResponseWriter>) {
    let mut to_send = ResponseArena::default();
    loop {
        let stop = {
            let state = shared.lock_state();
            let (mut state, _) = shared
                .wake
                .wait_timeout_while(state, shared.config.flush_interval, |s| {
                    !s.should_flush(&shared.config)
                })
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::swap(&mut state.building, &mut to_send);
            state.stop_requested
        };

        if !to_send.is_empty() {
            if let Err(e) = send_all(shared, writer.as_mut(), &to_send) {
                error!("Failed to send capture events, stopping the stream: {e}");
                let mut state = shared.lock_state();
                state.accepting = false;
                state.building.reset();
                return;
            }
            to_send.reset();
        }

        if stop {
            return;
        }
    }
}

fn send_all(
    shared: &Shared,
    writer: &mut dyn CaptureResponseWriter,
    arena: &ResponseArena,
) -> Result<(), TransportError> {
    for response in &arena.responses {
        let bytes = writer.write(response)?;
        shared.record_batch(response.capture_events_size(), bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_protos::WarningEvent;
    use std::time::Duration;

    fn event(i: u64) -> ClientCaptureEvent {
        ClientCaptureEvent::WarningEvent(WarningEvent { timestamp_ns: i, message: String::new() })
    }

    #[derive(Clone, Default)]
    struct RecordingWriter {
        batches: Arc<Mutex<Vec<Vec<u64>>>>,
    }

    impl CaptureResponseWriter for RecordingWriter {
        fn write(&mut self, response: &CaptureResponse) -> Result<usize, TransportError> {
            let timestamps = response
                .capture_events
                .iter()
                .map(|e| match e {
                    ClientCaptureEvent::WarningEvent(w) => w.timestamp_ns,
                    _ => u64::MAX,
                })
                .collect();
            self.batches.lock().unwrap().push(timestamps);
            Ok(response.capture_events_size())
        }
    }

    #[derive(Clone, Default)]
    struct SlowWriter {
        inner: RecordingWriter,
    }

    impl CaptureResponseWriter for SlowWriter {
        fn write(&mut self, response: &CaptureResponse) -> Result<usize, TransportError> {
            thread::sleep(Duration::from_millis(20));
            self.inner.write(response)
        }
    }

    struct FailingWriter;

    impl CaptureResponseWriter for FailingWriter {
        fn write(&mut self, _response: &CaptureResponse) -> Result<usize, TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn test_arena_splits_at_max_and_reuses_buffers() {
        let mut arena = ResponseArena::default();
        for i in 0..25 {
            arena.push(event(i), 10);
        }
        assert_eq!(arena.batch_count(), 3);
        assert_eq!(arena.current_batch_len(), 5);

        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.spare.len(), 3);
        assert!(arena.spare.iter().all(Vec::is_empty));

        arena.push(event(0), 10);
        assert_eq!(arena.spare.len(), 2);
    }

    #[test]
    fn test_stop_flushes_everything_in_order() {
        let writer = RecordingWriter::default();
        let collector = StreamClientCaptureEventCollector::new(Box::new(writer.clone()));
        for i in 0..1_234 {
            collector.add_event(event(i));
        }
        collector.stop_and_wait();

        let all: Vec<u64> = writer.batches.lock().unwrap().iter().flatten().copied().collect();
        assert_eq!(all, (0..1_234).collect::<Vec<_>>());
        assert_eq!(collector.stats().events, 1_234);
    }

    #[test]
    fn test_large_capture_split_into_bounded_responses() {
        let writer = RecordingWriter::default();
        let collector = StreamClientCaptureEventCollector::new(Box::new(writer.clone()));
        for i in 0..32_000 {
            collector.add_event(event(i));
        }
        collector.stop_and_wait();

        let batches = writer.batches.lock().unwrap();
        assert!((4..=7).contains(&batches.len()), "{} responses", batches.len());
        assert!(batches.iter().all(|b| b.len() <= crate::collector::MAX_EVENTS_PER_RESPONSE));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 32_000);
        assert_eq!(collector.stats().responses, batches.len() as u64);
    }

    #[test]
    fn test_add_after_stop_is_ignored_and_stop_is_idempotent() {
        let writer = RecordingWriter::default();
        let collector = StreamClientCaptureEventCollector::new(Box::new(writer.clone()));
        collector.add_event(event(1));
        collector.stop_and_wait();
        collector.add_event(event(2));
        collector.stop_and_wait();

        let all: Vec<u64> = writer.batches.lock().unwrap().iter().flatten().copied().collect();
        assert_eq!(all, vec![1]);
    }

    #[test]
    fn test_concurrent_stops_both_wait_for_flush() {
        let writer = SlowWriter::default();
        let collector =
            Arc::new(StreamClientCaptureEventCollector::new(Box::new(writer.clone())));
        for i in 0..5_000 {
            collector.add_event(event(i));
        }

        let stoppers: Vec<_> = (0..2)
            .map(|_| {
                let collector = Arc::clone(&collector);
                let batches = Arc::clone(&writer.inner.batches);
                thread::spawn(move || {
                    collector.stop_and_wait();
                    batches.lock().unwrap().iter().map(Vec::len).sum::<usize>()
                })
            })
            .collect();
        for stopper in stoppers {
            assert_eq!(stopper.join().unwrap(), 5_000);
        }
    }

    #[test]
    fn test_small_batches_flush_on_interval() {
        let writer = RecordingWriter::default();
        let collector = StreamClientCaptureEventCollector::new(Box::new(writer.clone()));
        collector.add_event(event(1));
        thread::sleep(Duration::from_millis(50));
        collector.add_event(event(2));
        collector.stop_and_wait();

        assert_eq!(*writer.batches.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_write_failure_stops_accepting() {
        let collector = StreamClientCaptureEventCollector::new(Box::new(FailingWriter));
        collector.add_event(event(1));
        thread::sleep(Duration::from_millis(50));
        collector.add_event(event(2));
        collector.stop_and_wait();
        assert_eq!(collector.stats(), CollectorStats::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CollectorConfig { flush_event_count_threshold: 0, ..CollectorConfig::default() };
        assert!(StreamClientCaptureEventCollector::with_config(
            Box::new(RecordingWriter::default()),
            config
        )
        .is_err());
    }
}
