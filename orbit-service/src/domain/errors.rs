//! Capture, transport and collaborator errors of the capture service.

use thiserror::Error;

/// A failure reported by a collaborator, carried as a human-readable message.
///
/// Instrumentation, API loading, executable queries and minidump parsing all
/// surface their failures this way; the message usually ends up verbatim in a
/// warning or error event on the capture stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ErrorMessage {
    message: String,
}

impl ErrorMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ErrorMessage {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CaptureServiceError {
    #[error("Cannot start capture because another capture is already in progress.")]
    AlreadyInProgress,

    #[error("Client closed the stream before sending a capture request.")]
    MissingCaptureRequest,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Capture stream was closed by the client")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
