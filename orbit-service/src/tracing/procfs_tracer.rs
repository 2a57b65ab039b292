//! Tracer backed only by `/proc`.
//!
//! Reports the thread names and modules of the target at capture start and
//! pairs user-space instrumentation entries and exits into function calls.
//! Kernel facilities (uprobes, sampling, tracepoints) are not available to
//! it and are reported back to the client as failures.

use super::{Tracer, TracerListener};
use crate::clock;
use crate::domain::Pid;
use crate::instrumentation::UserSpaceInstrumentationAddresses;
use crate::procfs::{self, DEFAULT_PROC_ROOT};
use log::{debug, info, warn};
use orbit_protos::{
    CaptureOptions, DynamicInstrumentationMethod, ErrorsWithPerfEventOpenEvent, FunctionCall,
    FunctionEntry, FunctionExit, FunctionThatFailedToBeInstrumented, ModulesSnapshot, ThreadName,
    ThreadNamesSnapshot, WarningInstrumentingWithUprobesEvent,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const UPROBES_UNSUPPORTED: &str = "Uprobes are not supported by the procfs tracer";

struct RunningCapture {
    pid: u32,
    listener: Arc<dyn TracerListener>,
    /// Open instrumented calls per thread, innermost last
    open_calls: HashMap<u32, Vec<FunctionEntry>>,
}

pub struct ProcfsTracer {
    proc_root: PathBuf,
    running: Mutex<Option<RunningCapture>>,
}

impl ProcfsTracer {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into(), running: Mutex::new(None) }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningCapture>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_initial_state(&self, options: &CaptureOptions, listener: &dyn TracerListener) {
        let pid = Pid(options.pid);
        let timestamp_ns = clock::now_ns();

        match procfs::read_thread_names(&self.proc_root, pid) {
            Ok(names) => listener.on_thread_names_snapshot(ThreadNamesSnapshot {
                timestamp_ns,
                thread_names: names
                    .into_iter()
                    .map(|(tid, name)| ThreadName { pid: pid.0, tid, name, timestamp_ns })
                    .collect(),
            }),
            Err(e) => warn!("Could not retrieve thread names of {pid}: {e}"),
        }

        match procfs::read_modules(&self.proc_root, pid) {
            Ok(modules) => {
                listener.on_modules_snapshot(ModulesSnapshot { pid: pid.0, timestamp_ns, modules });
            }
            Err(e) => warn!("Could not retrieve modules of {pid}: {e}"),
        }

        if options.dynamic_instrumentation_method == DynamicInstrumentationMethod::Uprobes
            && !options.instrumented_functions.is_empty()
        {
            listener.on_warning_instrumenting_with_uprobes(WarningInstrumentingWithUprobesEvent {
                timestamp_ns,
                functions_that_failed_to_instrument: options
                    .instrumented_functions
                    .iter()
                    .map(|f| FunctionThatFailedToBeInstrumented {
                        function_id: f.function_id,
                        error_message: UPROBES_UNSUPPORTED.to_string(),
                    })
                    .collect(),
            });
        }

        let mut failed_to_open = Vec::new();
        if options.samples_per_second > 0.0 {
            failed_to_open.push("callstack sampling".to_string());
        }
        if options.trace_thread_state {
            failed_to_open.push("thread state tracepoints".to_string());
        }
        if options.trace_gpu_driver {
            failed_to_open.push("GPU driver tracepoints".to_string());
        }
        if !failed_to_open.is_empty() {
            listener.on_errors_with_perf_event_open(ErrorsWithPerfEventOpenEvent {
                timestamp_ns,
                failed_to_open,
            });
        }
    }
}

impl Default for ProcfsTracer {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl Tracer for ProcfsTracer {
    fn start(
        &self,
        options: CaptureOptions,
        _addresses: Option<Arc<UserSpaceInstrumentationAddresses>>,
        listener: Arc<dyn TracerListener>,
    ) {
        let mut running = self.lock();
        if running.is_some() {
            warn!("Procfs tracer already started");
            return;
        }
        info!("Starting procfs tracer for {}", Pid(options.pid));
        self.report_initial_state(&options, listener.as_ref());
        *running = Some(RunningCapture { pid: options.pid, listener, open_calls: HashMap::new() });
    }

    fn stop(&self) {
        let Some(capture) = self.lock().take() else {
            return;
        };
        let unfinished: usize = capture.open_calls.values().map(Vec::len).sum();
        if unfinished > 0 {
            debug!("Procfs tracer stopped with {unfinished} unfinished instrumented calls");
        }
        info!("Stopped procfs tracer for {}", Pid(capture.pid));
    }

    fn process_function_entry(&self, entry: FunctionEntry) {
        if let Some(capture) = self.lock().as_mut() {
            capture.open_calls.entry(entry.tid).or_default().push(entry);
        }
    }

    fn process_function_exit(&self, exit: FunctionExit) {
        let (call, listener) = {
            let mut running = self.lock();
            let Some(capture) = running.as_mut() else {
                return;
            };
            let Some(stack) = capture.open_calls.get_mut(&exit.tid) else {
                debug!("FunctionExit without FunctionEntry on tid {}", exit.tid);
                return;
            };
            let Some(entry) = stack.pop() else {
                debug!("FunctionExit without FunctionEntry on tid {}", exit.tid);
                return;
            };
            let depth = i32::try_from(stack.len()).unwrap_or(i32::MAX);
            let call = FunctionCall {
                pid: exit.pid,
                tid: exit.tid,
                function_id: entry.function_id,
                duration_ns: exit.timestamp_ns.saturating_sub(entry.timestamp_ns),
                end_timestamp_ns: exit.timestamp_ns,
                depth,
                return_value: 0,
                registers: Vec::new(),
            };
            (call, Arc::clone(&capture.listener))
        };
        listener.on_function_call(call);
    }
}
