//! Capture stream transports.
//!
//! The capture core only sees the two halves of a bidirectional stream through
//! [`CaptureRequestReader`] and [`CaptureResponseWriter`]. The collector owns the
//! writer exclusively; the stop waiter owns the reader.
//!
//! ```text
//! client ── CaptureRequest ──▶ CaptureRequestReader  ──▶ stop waiter
//! client ◀── CaptureResponse ── CaptureResponseWriter ◀── collector sender thread
//! ```

use crate::domain::TransportError;
use crossbeam_channel::{Receiver, Sender};
use orbit_protos::{CaptureRequest, CaptureResponse, ClientCaptureEvent};
use std::io::Write;

/// Server-side writing half of a capture stream.
pub trait CaptureResponseWriter: Send {
    /// Write one batch and return the number of bytes it occupied on the wire.
    ///
    /// # Errors
    /// Returns [`TransportError`] if the client is gone or the write failed.
    fn write(&mut self, response: &CaptureResponse) -> Result<usize, TransportError>;
}

/// Server-side reading half of a capture stream.
pub trait CaptureRequestReader: Send {
    /// Block until the next request arrives.
    ///
    /// Returns `None` once the client has closed its send half or the stream broke.
    fn read(&mut self) -> Option<CaptureRequest>;
}

// ============================================================================
// In-Memory Stream
// ============================================================================

/// Create a connected in-memory capture stream.
#[must_use]
pub fn capture_stream() -> (ServerStream, ClientStream) {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (response_tx, response_rx) = crossbeam_channel::unbounded();
    (
        ServerStream {
            reader: ChannelRequestReader { requests: request_rx },
            writer: ChannelResponseWriter { responses: response_tx },
        },
        ClientStream { requests: Some(request_tx), responses: response_rx },
    )
}

/// Service end of [`capture_stream`].
pub struct ServerStream {
    reader: ChannelRequestReader,
    writer: ChannelResponseWriter,
}

impl ServerStream {
    #[must_use]
    pub fn split(self) -> (ChannelRequestReader, ChannelResponseWriter) {
        (self.reader, self.writer)
    }
}

pub struct ChannelRequestReader {
    requests: Receiver<CaptureRequest>,
}

impl CaptureRequestReader for ChannelRequestReader {
    fn read(&mut self) -> Option<CaptureRequest> {
        self.requests.recv().ok()
    }
}

pub struct ChannelResponseWriter {
    responses: Sender<CaptureResponse>,
}

impl CaptureResponseWriter for ChannelResponseWriter {
    /// Reports the in-memory size of the batch, since nothing is serialized.
    fn write(&mut self, response: &CaptureResponse) -> Result<usize, TransportError> {
        let bytes = response.capture_events_size() * std::mem::size_of::<ClientCaptureEvent>();
        self.responses.send(response.clone()).map_err(|_| TransportError::Closed)?;
        Ok(bytes)
    }
}

/// Client end of [`capture_stream`].
pub struct ClientStream {
    requests: Option<Sender<CaptureRequest>>,
    responses: Receiver<CaptureResponse>,
}

impl ClientStream {
    /// Send a request to the service.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] after [`writes_done`](Self::writes_done)
    /// or once the service dropped its reader.
    pub fn send(&self, request: CaptureRequest) -> Result<(), TransportError> {
        let sender = self.requests.as_ref().ok_or(TransportError::Closed)?;
        sender.send(request).map_err(|_| TransportError::Closed)
    }

    /// Close the client's send half. The service treats this as a stop request.
    pub fn writes_done(&mut self) {
        self.requests = None;
    }

    #[must_use]
    pub fn responses(&self) -> &Receiver<CaptureResponse> {
        &self.responses
    }

    /// Block until the service closes its writer and return every batch received.
    #[must_use]
    pub fn collect_responses(&self) -> Vec<CaptureResponse> {
        self.responses.iter().collect()
    }
}

// ============================================================================
// JSON Lines
// ============================================================================

/// Writes every batch as one line of JSON.
pub struct JsonLinesResponseWriter<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> JsonLinesResponseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> CaptureResponseWriter for JsonLinesResponseWriter<W> {
    fn write(&mut self, response: &CaptureResponse) -> Result<usize, TransportError> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        self.inner.write_all(&line)?;
        self.inner.flush()?;
        Ok(line.len())
    }
}
