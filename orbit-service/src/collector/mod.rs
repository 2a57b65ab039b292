//! Client event collection
//!
//! The collector is the last stage of the pipeline: the processor hands it
//! finished [`ClientCaptureEvent`]s from any thread and it streams them to the
//! client in batches.

mod stream;

pub use stream::{CollectorStats, StreamClientCaptureEventCollector};

use crate::domain::ErrorMessage;
use orbit_protos::ClientCaptureEvent;
use std::time::Duration;

/// Events per `CaptureResponse` before a new one is started
pub const MAX_EVENTS_PER_RESPONSE: usize = 10_000;

/// Building-batch size that wakes the sender early
pub const FLUSH_EVENT_COUNT_THRESHOLD: usize = 5_000;

/// Longest time an event waits in the building arena
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(20);

/// Sink for client events.
pub trait ClientCaptureEventCollector: Send + Sync {
    /// Queue one event. Only holds a short critical section; never waits on the transport.
    fn add_event(&self, event: ClientCaptureEvent);

    /// Flush everything queued so far and block until it has been written.
    ///
    /// Idempotent. Afterwards [`add_event`](Self::add_event) is a no-op.
    fn stop_and_wait(&self);
}

/// Batching parameters of [`StreamClientCaptureEventCollector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub max_events_per_response: usize,
    pub flush_event_count_threshold: usize,
    pub flush_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_events_per_response: MAX_EVENTS_PER_RESPONSE,
            flush_event_count_threshold: FLUSH_EVENT_COUNT_THRESHOLD,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

impl CollectorConfig {
    /// Check that the early-flush threshold fits inside one response.
    ///
    /// # Errors
    /// Returns an [`ErrorMessage`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ErrorMessage> {
        if self.max_events_per_response == 0 {
            return Err(ErrorMessage::new("max_events_per_response must be positive"));
        }
        if self.flush_event_count_threshold == 0
            || self.flush_event_count_threshold >= self.max_events_per_response
        {
            return Err(ErrorMessage::new(format!(
                "flush_event_count_threshold ({}) must be in 1..{}",
                self.flush_event_count_threshold, self.max_events_per_response
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ErrorMessage::new("flush_interval must be positive"));
        }
        Ok(())
    }
}
