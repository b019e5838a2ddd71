#![deny(missing_docs)]
//! # Simulate
//!
//! The `simulate` binary drives the yield engine from the command line. It
//! opens one device session, builds the kernel once, and then either:
//!
//! - **Batch mode** (default): runs the `--area`/`--temperature` pairs given
//!   as arguments in a single launch and prints one estimate per line.
//! - **Serve mode** (`--stdin`): reads one JSON request body per line from
//!   stdin and writes one JSON response per line to stdout, exactly as the
//!   calling backend would see them.
//!
//! ```text
//! simulate --area 100 --temperature 25 --area 100 --temperature 35
//! echo '{"area": 100, "temp": 25}' | simulate --stdin
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use cropsim::{
    ComputeBackend, DevicePreference, EmulatedBackend, EngineConfig, SimulationEngine,
    SimulationHandler, YieldRequest,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Crop yield simulation on a compute device")]
/// Command-line arguments for the simulate binary.
struct Args {
    /// Field area in m² (repeat, paired with --temperature)
    #[arg(long)]
    area: Vec<f32>,

    /// Average temperature in °C (repeat, paired with --area)
    #[arg(long)]
    temperature: Vec<f32>,

    /// Compute backend (emulated, cuda)
    #[arg(long, default_value = "emulated")]
    backend: String,

    /// Device preference (first, gpu, cpu, accelerator, P:D); overrides CROPSIM_DEVICE
    #[arg(long)]
    device: Option<DevicePreference>,

    /// Bound on any single device wait, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Lanes per work group
    #[arg(long)]
    work_group: Option<u32>,

    /// Serve line-delimited JSON requests from stdin
    #[arg(long)]
    stdin: bool,

    /// Output file for run statistics
    #[arg(long)]
    out: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only results.
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = EngineConfig::from_env();
    if let Some(device) = args.device {
        config = config.with_device(device);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    if let Some(work_group) = args.work_group {
        config = config.with_work_group(work_group);
    }

    info!(
        "[SIMULATE:INIT] Backend: {}, device: {}, timeout: {:?}, work group: {}",
        args.backend, config.device, config.timeout, config.work_group
    );

    match args.backend.as_str() {
        "emulated" => drive(Arc::new(EmulatedBackend::new()), config, &args),
        #[cfg(feature = "cuda")]
        "cuda" => drive(Arc::new(cropsim::CudaBackend::new()), config, &args),
        #[cfg(not(feature = "cuda"))]
        "cuda" => bail!("this build has no CUDA support; rebuild with --features cuda"),
        other => bail!("unknown backend '{}' (expected emulated or cuda)", other),
    }
}

/// Statistics about one invocation.
#[derive(Debug, Default)]
struct RunStats {
    lines: u64,
    failed_lines: u64,
}

fn drive<B: ComputeBackend>(backend: Arc<B>, config: EngineConfig, args: &Args) -> Result<()> {
    let engine = Arc::new(SimulationEngine::new(backend, config));

    let warmup_start = Instant::now();
    engine.warm_up().context("failed to open the device and build the kernel")?;
    info!(
        "[SIMULATE:WARMUP] Session ready ({:.1} ms)",
        warmup_start.elapsed().as_secs_f64() * 1000.0
    );

    let start_time = Instant::now();
    let outcome = if args.stdin {
        serve_stdin(SimulationHandler::new(engine.clone()))
    } else {
        run_batch(&engine, args).map(|()| RunStats::default())
    };
    let elapsed = start_time.elapsed();

    // Shut down even when the run failed.
    engine.shutdown();
    let run_stats = outcome?;

    let stats = engine.stats();
    info!(
        "[SIMULATE:DONE] {} request(s), {} item(s), {} failure(s) in {:.2} ms",
        stats.requests,
        stats.items,
        stats.failures,
        elapsed.as_secs_f64() * 1000.0
    );

    if let Some(ref out_file) = args.out {
        save_results(out_file, &engine, &run_stats, elapsed)?;
    }
    Ok(())
}

fn run_batch<B: ComputeBackend>(engine: &SimulationEngine<B>, args: &Args) -> Result<()> {
    if args.area.len() != args.temperature.len() {
        bail!(
            "got {} --area value(s) but {} --temperature value(s)",
            args.area.len(),
            args.temperature.len()
        );
    }

    let request: YieldRequest = args
        .area
        .iter()
        .copied()
        .zip(args.temperature.iter().copied())
        .collect();
    if request.is_empty() {
        warn!("[SIMULATE:BATCH] No samples given; nothing to do");
        return Ok(());
    }

    let result = engine.simulate(&request).context("simulation failed")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (sample, value) in request.samples().iter().zip(result.values()) {
        writeln!(out, "{}\t{}\t{}", sample.area, sample.temperature, value)?;
    }
    Ok(())
}

fn serve_stdin<B: ComputeBackend>(handler: SimulationHandler<B>) -> Result<RunStats> {
    let mut stats = RunStats::default();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    info!("[SIMULATE:SERVE] Reading JSON requests from stdin");
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let response = handler.respond(&line);
        if !response.is_success() {
            stats.failed_lines += 1;
        }
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        out.flush()?;
    }

    info!(
        "[SIMULATE:SERVE] Served {} request(s), {} failed",
        stats.lines, stats.failed_lines
    );
    Ok(stats)
}

fn save_results<B: ComputeBackend>(
    path: &str,
    engine: &SimulationEngine<B>,
    run_stats: &RunStats,
    elapsed: Duration,
) -> Result<()> {
    use serde_json::json;
    use std::fs::File;

    let results = json!({
        "simulate": {
            "backend": engine.backend().name(),
            "config": engine.config(),
            "kernel": {
                "name": engine.source().name,
                "version": engine.source().version,
            },
            "engine": engine.stats(),
            "served_lines": run_stats.lines,
            "failed_lines": run_stats.failed_lines,
            "wall_time_ms": elapsed.as_secs_f64() * 1000.0,
        }
    });

    let mut file = File::create(path).with_context(|| format!("failed to create {}", path))?;
    writeln!(file, "{}", serde_json::to_string_pretty(&results)?)?;
    info!("[SIMULATE:DONE] Saved results to {}", path);

    Ok(())
}
