//! Producer event processing
//!
//! Single fan-in point of a capture. Every producer calls
//! [`ProducerEventProcessor::process_event`] with its producer id; the
//! processor converts the event to its client shape and hands it to the
//! collector.
//!
//! ```text
//! tracer ──────┐
//! memory info ─┤                      ┌────────────────────────┐
//! introspection┼──▶ FunctionEntryExit ─▶ InterningEventProcessor ─▶ collector
//! listeners ───┘    Hijacker          └────────────────────────┘
//!                      │ FunctionEntry / FunctionExit
//!                      ▼
//!                    tracer
//! ```
//!
//! Per-producer order is preserved. No order is asserted across producers.

mod client;
mod hijacker;
mod intern;

pub use client::InterningEventProcessor;
pub use hijacker::{FunctionEntryExitHijacker, FunctionEntryExitSink};
pub use intern::InternPool;

use orbit_protos::ProducerCaptureEvent;

/// Entry point for every producer of a capture.
///
/// Never rejects an event; contract violations by producers are logged.
pub trait ProducerEventProcessor: Send + Sync {
    fn process_event(&self, producer_id: u64, event: ProducerCaptureEvent);
}
