//! # Orbit Capture Service
//!
//! The part of Orbit that runs next to the profiled process. It drives the
//! producers of a capture, funnels their events through one ordered
//! pipeline and streams them to the client, while enforcing the start/stop,
//! memory-pressure and target-liveness contracts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Client (capture stream)                      │
//! └───────────┬─────────────────────────────────────▲────────────────┘
//!             │ CaptureRequest / writes done        │ CaptureResponse
//!             ▼                                     │
//! ┌────────────────────────┐            ┌────────────────────────────┐
//! │ StopCaptureRequest-    │            │ StreamClientCaptureEvent-  │
//! │ Waiter                 │            │ Collector (sender thread)  │
//! └───────────┬────────────┘            └─────────────▲──────────────┘
//!             │ options / stop reason                 │ ClientCaptureEvent
//!             ▼                                       │
//! ┌────────────────────────┐   ProducerCaptureEvent ┌─┴──────────────┐
//! │ Linux/Windows          │───────────────────────▶│ Interning-     │
//! │ CaptureService         │                        │ EventProcessor │
//! │  • tracer              │──▶ FunctionEntryExit ──▶│                │
//! │  • memory info         │    Hijacker            └────────────────┘
//! │  • introspection       │
//! │  • listeners           │◀── memory watchdog, duration cap
//! │  • post-mortem         │
//! └────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Pipeline
//!
//! - [`service`]: Capture state machine, framing events, start/finalize sequences
//! - [`processor`]: Producer event conversion and interning; entry/exit hijacking
//! - [`collector`]: Double-buffered batching towards the client
//! - [`transport`]: Request/response stream seams and their in-memory and JSON lines adapters
//!
//! ### Producers
//!
//! - [`tracing`]: Tracer seam, tracing handler and the procfs tracer
//! - [`memory_info`]: Periodic system and process memory samples
//! - [`introspection`]: The service's own scopes as API events
//! - [`instrumentation`]: User-space instrumentation report, filtering and trampoline ranges
//! - [`api_loader`]: Orbit API toggle in the target
//!
//! ### Stop arbitration and post-mortem
//!
//! - [`stop_waiter`]: Stream and in-process start/stop waiters
//! - [`stop_slot`]: First-wins stop flag shared by the stop triggers
//! - [`watchdog`]: Memory watchdog
//! - [`postmortem`]: Target process state and minidump signal extraction
//!
//! ### Support
//!
//! - [`clock`]: Monotonic capture clock
//! - [`procfs`]: `/proc` parsing
//! - [`process`]: Executable path and build id queries
//! - [`domain`]: Core domain types and errors
//! - [`cli`]: Command-line arguments of the binary
//!
//! ## Key Concepts
//!
//! - **Producer id**: every event is tagged with the producer that emitted it;
//!   producer-local intern keys are only unique per producer
//! - **Interning**: callstacks and strings are sent once and referenced by key
//! - **Framing**: `CaptureStarted` and `ClockResolutionEvent` open every
//!   capture, `CaptureFinished` closes it
//! - **First stop wins**: client, watchdog and duration cap race for one stop slot

pub mod api_loader;
pub mod cli;
pub mod clock;
pub mod collector;
pub mod domain;
pub mod instrumentation;
pub mod introspection;
pub mod memory_info;
pub mod postmortem;
pub mod process;
pub mod processor;
pub mod procfs;
pub mod service;
pub mod stop_slot;
pub mod stop_waiter;
pub mod tracing;
pub mod transport;
pub mod watchdog;
