use super::{
    create_introspection_listener, stop_in_parallel, CaptureServiceBase, CaptureStartStopListener,
};
use crate::collector::{ClientCaptureEventCollector, StreamClientCaptureEventCollector};
use crate::domain::CaptureServiceError;
use crate::introspection;
use crate::postmortem::TargetProcessStateAfterCapture;
use crate::stop_waiter::{StopCaptureRequestWaiter, StreamStopCaptureRequestWaiter};
use crate::tracing::{TracerFactory, TracingHandler};
use crate::transport::{CaptureRequestReader, CaptureResponseWriter};
use log::{info, warn};
use orbit_protos::{ProcessState, TerminationSignal, WINDOWS_TRACING_PRODUCER_ID};
use std::sync::Arc;

/// Capture service for Windows targets: one ETW tracer and the listeners.
///
/// The target's state after the capture is not determined.
pub struct WindowsCaptureService {
    base: CaptureServiceBase,
    tracer_factory: Arc<dyn TracerFactory>,
}

impl WindowsCaptureService {
    #[must_use]
    pub fn new(tracer_factory: Arc<dyn TracerFactory>) -> Self {
        Self { base: CaptureServiceBase::new(), tracer_factory }
    }

    #[must_use]
    pub fn with_base(mut self, base: CaptureServiceBase) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn base(&self) -> &CaptureServiceBase {
        &self.base
    }

    pub fn add_capture_start_stop_listener(&self, listener: Arc<dyn CaptureStartStopListener>) {
        self.base.add_capture_start_stop_listener(listener);
    }

    /// # Errors
    /// Same as [`LinuxCaptureService::capture`](super::LinuxCaptureService::capture).
    pub fn capture(
        &self,
        reader: Box<dyn CaptureRequestReader>,
        writer: Box<dyn CaptureResponseWriter>,
    ) -> Result<(), CaptureServiceError> {
        let collector = Arc::new(StreamClientCaptureEventCollector::new(writer));
        let waiter = Arc::new(StreamStopCaptureRequestWaiter::new(reader));
        self.capture_with(collector, waiter)
    }

    /// # Errors
    /// Same as [`LinuxCaptureService::capture`](super::LinuxCaptureService::capture).
    pub fn capture_with(
        &self,
        collector: Arc<dyn ClientCaptureEventCollector>,
        waiter: Arc<dyn StopCaptureRequestWaiter>,
    ) -> Result<(), CaptureServiceError> {
        let mut session = self.base.initialize(collector)?;
        let Some(options) = waiter.wait_for_start_capture_request() else {
            warn!("{}", CaptureServiceError::MissingCaptureRequest);
            return Err(CaptureServiceError::MissingCaptureRequest);
        };

        let processor = session.processor();
        let tracing_handler = TracingHandler::new(
            self.tracer_factory.as_ref(),
            Arc::clone(&processor),
            WINDOWS_TRACING_PRODUCER_ID,
        );
        session.start_event_processing(&options);
        let introspection_listener = options
            .enable_introspection
            .then(|| create_introspection_listener(Arc::clone(&processor)));
        tracing_handler.start(options.clone(), None);
        for listener in self.base.capture_start_stop_listeners() {
            listener.on_capture_start_requested(&options, Arc::clone(&processor));
        }

        let reason = waiter.wait_for_stop_capture_request();
        info!("Stopping capture: {reason}");

        {
            let _scope = introspection::scope("WindowsCaptureService::finalize");
            let stop_tracing = || tracing_handler.stop();
            let internal_stops: [&(dyn Fn() + Sync); 1] = [&stop_tracing];
            stop_in_parallel(&internal_stops, &self.base.capture_start_stop_listeners());
        }
        drop(introspection_listener);

        session.finalize_event_processing(
            reason,
            TargetProcessStateAfterCapture {
                process_state: ProcessState::Unknown,
                termination_signal: TerminationSignal::Unspecified,
            },
        );
        Ok(())
    }
}
