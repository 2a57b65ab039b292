//! Periodic memory sampling for the duration of a capture.

use crate::clock;
use crate::domain::Pid;
use crate::introspection;
use crate::processor::ProducerEventProcessor;
use crate::procfs;
use crate::stop_slot::StopSlot;
use log::{debug, error, info};
use orbit_protos::{
    CaptureOptions, MemoryUsageEvent, ProcessMemoryUsage, ProducerCaptureEvent, SystemMemoryUsage,
    MEMORY_INFO_PRODUCER_ID,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Sampler {
    stop: Arc<StopSlot<()>>,
    thread: JoinHandle<()>,
}

/// Emits a [`MemoryUsageEvent`] every sampling period while started.
///
/// Sampling is disabled when the options carry a zero period.
pub struct MemoryInfoHandler {
    processor: Arc<dyn ProducerEventProcessor>,
    proc_root: PathBuf,
    sampler: Mutex<Option<Sampler>>,
}

impl MemoryInfoHandler {
    #[must_use]
    pub fn new(processor: Arc<dyn ProducerEventProcessor>, proc_root: impl Into<PathBuf>) -> Self {
        Self { processor, proc_root: proc_root.into(), sampler: Mutex::new(None) }
    }

    pub fn start(&self, options: &CaptureOptions) {
        let Some(period) = options.memory_sampling_period() else {
            debug!("Memory sampling disabled");
            return;
        };
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if sampler.is_some() {
            error!("Memory sampling already started");
            return;
        }
        info!("Starting memory sampling every {period:?}");

        let stop = Arc::new(StopSlot::new());
        let thread_stop = Arc::clone(&stop);
        let processor = Arc::clone(&self.processor);
        let proc_root = self.proc_root.clone();
        let pid = Pid(options.pid);
        let thread = thread::spawn(move || {
            sample_loop(&*processor, &proc_root, pid, period, &thread_stop);
        });
        *sampler = Some(Sampler { stop, thread });
    }

    /// Stop sampling and wait for the sampler thread. No-op if not started.
    pub fn stop(&self) {
        let Some(sampler) = self.sampler.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        sampler.stop.request_stop(());
        if sampler.thread.join().is_err() {
            error!("Memory sampling thread panicked");
        }
    }
}

impl Drop for MemoryInfoHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop(
    processor: &dyn ProducerEventProcessor,
    proc_root: &Path,
    pid: Pid,
    period: Duration,
    stop: &StopSlot<()>,
) {
    loop {
        let event = sample(proc_root, pid);
        processor.process_event(MEMORY_INFO_PRODUCER_ID, ProducerCaptureEvent::MemoryUsageEvent(event));
        if stop.wait_timeout(period) {
            return;
        }
    }
}

/// One memory sample. Counters that cannot be read are left out.
#[must_use]
pub fn sample(proc_root: &Path, pid: Pid) -> MemoryUsageEvent {
    let _scope = introspection::scope("MemoryInfoHandler::sample");
    let timestamp_ns = clock::now_ns();
    let system_memory_usage = match procfs::read_meminfo(proc_root) {
        Ok(info) => Some(SystemMemoryUsage {
            timestamp_ns,
            total_kb: info.total_kb,
            free_kb: info.free_kb,
            available_kb: info.available_kb,
            buffers_kb: info.buffers_kb,
            cached_kb: info.cached_kb,
        }),
        Err(e) => {
            debug!("{e}");
            None
        }
    };
    let process_memory_usage = procfs::read_rss_in_bytes(proc_root, &pid.0.to_string())
        .map(|rss_bytes| ProcessMemoryUsage { timestamp_ns, pid: pid.0, rss_bytes });
    MemoryUsageEvent { timestamp_ns, system_memory_usage, process_memory_usage }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, ProducerCaptureEvent)>>);

    impl ProducerEventProcessor for Recorder {
        fn process_event(&self, producer_id: u64, event: ProducerCaptureEvent) {
            self.0.lock().unwrap().push((producer_id, event));
        }
    }

    fn synthetic_proc() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemFree: 400 kB\nMemAvailable: 600 kB\nBuffers: 10 kB\nCached: 20 kB\n",
        )
        .unwrap();
        fs::create_dir(root.path().join("42")).unwrap();
        let mut stat = String::from("42 (app) S");
        for i in 4..=24 {
            stat.push_str(&format!(" {i}"));
        }
        fs::write(root.path().join("42").join("stat"), stat).unwrap();
        root
    }

    #[test]
    fn test_sample_reads_system_and_process() {
        let root = synthetic_proc();
        let event = sample(root.path(), Pid(42));
        let system = event.system_memory_usage.unwrap();
        assert_eq!(system.total_kb, 1000);
        assert_eq!(system.available_kb, 600);
        let process = event.process_memory_usage.unwrap();
        assert_eq!(process.pid, 42);
        assert_eq!(process.rss_bytes, 24 * procfs::page_size());
    }

    #[test]
    fn test_sample_of_missing_process() {
        let root = synthetic_proc();
        let event = sample(root.path(), Pid(7));
        assert!(event.system_memory_usage.is_some());
        assert!(event.process_memory_usage.is_none());
    }

    #[test]
    fn test_handler_samples_until_stopped() {
        let root = synthetic_proc();
        let recorder = Arc::new(Recorder::default());
        let handler = MemoryInfoHandler::new(recorder.clone(), root.path());
        let mut options = CaptureOptions::for_pid(42);
        options.memory_sampling_period_ns = 5_000_000;

        handler.start(&options);
        thread::sleep(Duration::from_millis(30));
        handler.stop();
        handler.stop();

        let events = recorder.0.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|(id, e)| *id == MEMORY_INFO_PRODUCER_ID
            && matches!(e, ProducerCaptureEvent::MemoryUsageEvent(_))));
    }

    #[test]
    fn test_zero_period_disables_sampling() {
        let recorder = Arc::new(Recorder::default());
        let handler = MemoryInfoHandler::new(recorder.clone(), "/nonexistent");
        handler.start(&CaptureOptions::for_pid(1));
        handler.stop();
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
