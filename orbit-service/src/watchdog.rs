//! Memory watchdog bounding the service's own resident set during a capture.

use crate::domain::ErrorMessage;
use crate::procfs::{self, DEFAULT_PROC_ROOT};
use crate::stop_slot::StopSlot;
use crate::stop_waiter::StopCaptureReason;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often the watchdog samples the resident set.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWatchdogConfig {
    pub poll_interval: Duration,
    /// Resident set size above which the capture is stopped
    pub threshold_bytes: u64,
}

impl MemoryWatchdogConfig {
    /// Threshold of half the machine's physical memory.
    ///
    /// # Errors
    /// Returns an [`ErrorMessage`] if `/proc/meminfo` cannot be read.
    pub fn from_system() -> Result<Self, ErrorMessage> {
        let total = procfs::read_meminfo(Path::new(DEFAULT_PROC_ROOT))?.total_bytes();
        let threshold_bytes = total / 2;
        info!(
            "Starting memory watchdog with threshold {threshold_bytes} B because total physical memory is {total} B"
        );
        Ok(Self::with_threshold(threshold_bytes))
    }

    #[must_use]
    pub fn with_threshold(threshold_bytes: u64) -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, threshold_bytes }
    }
}

/// Source of the service's resident set size.
pub trait RssSource: Send + Sync {
    /// Current RSS in bytes, `None` if it cannot be determined.
    fn rss_bytes(&self) -> Option<u64>;
}

/// Reads `<proc_root>/self/stat`.
#[derive(Debug, Clone)]
pub struct ProcSelfRss {
    proc_root: PathBuf,
}

impl ProcSelfRss {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }
}

impl Default for ProcSelfRss {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl RssSource for ProcSelfRss {
    fn rss_bytes(&self) -> Option<u64> {
        procfs::read_rss_in_bytes(&self.proc_root, "self")
    }
}

/// Polls the resident set until the capture stops or the threshold is exceeded.
pub struct MemoryWatchdog {
    config: MemoryWatchdogConfig,
    rss: Box<dyn RssSource>,
}

impl MemoryWatchdog {
    #[must_use]
    pub fn new(config: MemoryWatchdogConfig) -> Self {
        Self::with_rss_source(config, Box::new(ProcSelfRss::default()))
    }

    #[must_use]
    pub fn with_rss_source(config: MemoryWatchdogConfig, rss: Box<dyn RssSource>) -> Self {
        Self { config, rss }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryWatchdogConfig {
        &self.config
    }

    /// Run until `stop` holds a reason. Fires
    /// [`StopCaptureReason::MemoryWatchdog`] unless another stop got there first.
    pub fn run(&self, stop: &StopSlot<StopCaptureReason>) {
        let mut rss_error_logged = false;
        loop {
            if stop.wait_timeout(self.config.poll_interval) {
                info!("Stopping memory watchdog as the capture was stopped");
                return;
            }

            let Some(rss) = self.rss.rss_bytes() else {
                if !rss_error_logged {
                    error!("Could not read the memory usage of the service");
                    rss_error_logged = true;
                }
                continue;
            };

            if rss > self.config.threshold_bytes {
                if stop.request_stop(StopCaptureReason::MemoryWatchdog) {
                    error!("Memory threshold exceeded: stopping capture");
                } else {
                    info!("Memory threshold exceeded, but the capture was already stopped");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct FixedRss(Arc<AtomicU64>);

    impl RssSource for FixedRss {
        fn rss_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    struct NoRss;

    impl RssSource for NoRss {
        fn rss_bytes(&self) -> Option<u64> {
            None
        }
    }

    fn fast_config(threshold_bytes: u64) -> MemoryWatchdogConfig {
        MemoryWatchdogConfig { poll_interval: Duration::from_millis(5), threshold_bytes }
    }

    #[test]
    fn test_fires_when_threshold_exceeded() {
        let rss = Arc::new(AtomicU64::new(10));
        let watchdog = MemoryWatchdog::with_rss_source(fast_config(100), Box::new(FixedRss(Arc::clone(&rss))));
        let stop = Arc::new(StopSlot::new());

        let bump = Arc::clone(&rss);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            bump.store(101, Ordering::Relaxed);
        });
        watchdog.run(&stop);
        handle.join().unwrap();
        assert_eq!(stop.reason(), Some(StopCaptureReason::MemoryWatchdog));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let rss = Arc::new(AtomicU64::new(100));
        let watchdog = MemoryWatchdog::with_rss_source(fast_config(100), Box::new(FixedRss(rss)));
        let stop = Arc::new(StopSlot::new());
        let stopper = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stopper.request_stop(StopCaptureReason::ClientStop);
        });
        watchdog.run(&stop);
        handle.join().unwrap();
        assert_eq!(stop.reason(), Some(StopCaptureReason::ClientStop));
    }

    #[test]
    fn test_unreadable_rss_keeps_polling() {
        let watchdog = MemoryWatchdog::with_rss_source(fast_config(0), Box::new(NoRss));
        let stop = Arc::new(StopSlot::new());
        let stopper = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stopper.request_stop(StopCaptureReason::ClientStop);
        });
        watchdog.run(&stop);
        handle.join().unwrap();
        assert_eq!(stop.reason(), Some(StopCaptureReason::ClientStop));
    }

    #[test]
    fn test_config_from_system() {
        let config = MemoryWatchdogConfig::from_system().unwrap();
        assert!(config.threshold_bytes > 0);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(ProcSelfRss::default().rss_bytes().unwrap() > 0);
    }
}
