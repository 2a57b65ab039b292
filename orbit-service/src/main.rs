//! # orbit-service - Main Entry Point
//!
//! Captures one process with the procfs tracer and writes every
//! `CaptureResponse` as a JSON line. The capture stops on Ctrl+C, after
//! `--duration` seconds, or when the memory watchdog fires.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use orbit_service::cli::Args;
use orbit_service::collector::StreamClientCaptureEventCollector;
use orbit_service::domain::Pid;
use orbit_service::procfs::{self, DEFAULT_PROC_ROOT};
use orbit_service::service::LinuxCaptureService;
use orbit_service::stop_waiter::{InProcessStopCaptureRequestWaiter, StopCaptureReason};
use orbit_service::tracing::{ProcfsTracer, Tracer};
use orbit_service::transport::{CaptureResponseWriter, JsonLinesResponseWriter};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::Arc;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn open_output(args: &Args) -> Result<Box<dyn CaptureResponseWriter>> {
    Ok(match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(JsonLinesResponseWriter::new(BufWriter::new(file)))
        }
        None => Box::new(JsonLinesResponseWriter::new(io::stdout())),
    })
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let pid = Pid(args.pid);
    let proc_root = Path::new(DEFAULT_PROC_ROOT);
    if !procfs::process_exists(proc_root, pid).context("Failed to look up target process")? {
        anyhow::bail!("Process {} not found", pid.0);
    }

    info!("orbit-service v{}", env!("CARGO_PKG_VERSION"));
    let service = LinuxCaptureService::new(Arc::new(|| -> Arc<dyn Tracer> {
        Arc::new(ProcfsTracer::default())
    }))
    .context("Failed to set up capture service")?;
    let collector = Arc::new(StreamClientCaptureEventCollector::new(open_output(&args)?));
    let waiter = Arc::new(InProcessStopCaptureRequestWaiter::new());
    waiter.start_capture(args.capture_options());

    let capture_waiter = Arc::clone(&waiter);
    let stats_collector = Arc::clone(&collector);
    let mut capture = tokio::task::spawn_blocking(move || {
        service.capture_with(stats_collector, capture_waiter)
    });

    tokio::select! {
        result = &mut capture => {
            result.context("Capture task failed")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received: stopping capture");
            waiter.stop_capture(StopCaptureReason::ClientStop);
            capture.await.context("Capture task failed")??;
        }
    }

    // The waiter thread of the capture is still parked if something else stopped it.
    waiter.stop_capture(StopCaptureReason::ClientStop);

    let stats = collector.stats();
    eprintln!("captured {} events in {} responses ({} bytes)", stats.events, stats.responses, stats.bytes);
    Ok(())
}
