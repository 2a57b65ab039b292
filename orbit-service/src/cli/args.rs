//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "orbit-service",
    about = "Capture a running process and stream the capture as JSON lines",
    after_help = "\
EXAMPLES:
    orbit-service --pid 1234                           Capture until Ctrl+C, write to stdout
    orbit-service --pid 1234 --duration 10 -o cap.jsonl  Capture for 10 seconds into a file
    RUST_LOG=info orbit-service --pid 1234 --introspection"
)]
pub struct Args {
    /// Process ID to capture
    #[arg(short, long)]
    pub pid: u32,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Write capture responses to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Memory sampling period in milliseconds (0 = disabled)
    #[arg(long, default_value = "0")]
    pub memory_sampling_ms: u64,

    /// Report the service's own scopes in the capture
    #[arg(long)]
    pub introspection: bool,

    /// Callstack sampling frequency (0 = disabled)
    #[arg(long, default_value = "0")]
    pub samples_per_second: f64,
}

impl Args {
    /// Capture options described by the arguments.
    #[must_use]
    pub fn capture_options(&self) -> orbit_protos::CaptureOptions {
        let mut options = orbit_protos::CaptureOptions::for_pid(self.pid);
        options.max_capture_duration_ns =
            (self.duration > 0).then(|| self.duration.saturating_mul(1_000_000_000));
        options.memory_sampling_period_ns = self.memory_sampling_ms.saturating_mul(1_000_000);
        options.enable_introspection = self.introspection;
        options.samples_per_second = self.samples_per_second;
        options
    }
}
