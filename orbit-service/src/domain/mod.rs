//! Domain model for the capture service
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Structured error handling for collaborators and transports

pub mod errors;
pub mod types;

pub use types::Pid;

pub use errors::{CaptureServiceError, ErrorMessage, TransportError};
