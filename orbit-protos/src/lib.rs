//! # Capture Protocol Data Model
//!
//! Defines the messages exchanged between capture producers, the capture service and
//! the streaming client. The service never interprets payloads beyond what is needed
//! for routing and interning; producers own the meaning of their events.
//!
//! ## Message Flow
//!
//! ```text
//! producers ──ProducerCaptureEvent──▶ processor ──ClientCaptureEvent──▶ collector
//!                                                                          │
//! client ◀──────────────── CaptureResponse { capture_events } ◀────────────┘
//! client ─────────────────── CaptureRequest { capture_options } ──────────▶ service
//! ```
//!
//! ## Key Types
//!
//! - [`CaptureOptions`] - Immutable per-capture configuration sent by the client
//! - [`ProducerCaptureEvent`] - Everything a producer may hand to the processor
//! - [`ClientCaptureEvent`] - Everything the client may receive on the stream
//! - [`CaptureResponse`] - One batch of client events
//! - [`CaptureFinished`] - Terminal framing event of every capture

pub mod capture;
pub mod constants;
pub mod events;
pub mod options;

pub use capture::{
    ApiEvent, CaptureFinished, CaptureRequest, CaptureResponse, CaptureStarted, CaptureStatus,
    ClientCaptureEvent, ProcessState, ProducerCaptureEvent, TerminationSignal,
};
pub use constants::*;
pub use events::*;
pub use options::{
    CaptureOptions, DynamicInstrumentationMethod, InstrumentedFunction, UnwindingMethod,
};
