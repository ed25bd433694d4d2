// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::Receiver;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Histogram;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use scx_adaptive::stats::format_workloads;
use scx_adaptive::Allocator;
use scx_adaptive::ChannelSink;
use scx_adaptive::Config;
use scx_adaptive::Event;
use scx_adaptive::EventSink;
use scx_adaptive::History;
use scx_adaptive::LogSink;
use scx_adaptive::ProcSampler;
use scx_adaptive::Scheduler;
use scx_adaptive::SharedSink;
use scx_adaptive::SystemSampler;
use scx_adaptive::WorkloadSet;

/// scx_adaptive: adaptive memory allocation and CPU quantum scheduling
///
/// A fleet of simulated workloads publishes fluctuating CPU usage from their
/// own threads. On every interval the allocator rebalances a fixed memory
/// budget across them: workloads are scaled down proportionally while the
/// fleet is over budget, large ones are shrunk, small ones grown from what
/// is left and the rest are nudged by a small random amount.
///
/// Concurrently the scheduler visits the workloads least recently busy first
/// and grants each a quantum that shrinks as its CPU usage grows.
///
/// Usage figures are synthetic. Nothing is isolated, paged or pinned.
#[derive(Debug, Parser)]
struct Opts {
    /// JSON config, inline or as f:PATH. Command line options override it.
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Total memory budget shared by all workloads, in MB.
    #[clap(short = 'b', long)]
    budget: Option<f64>,

    /// Allocation interval in seconds.
    #[clap(short = 'i', long)]
    interval: Option<f64>,

    /// Number of allocation passes, 0 runs until interrupted.
    #[clap(short = 'n', long)]
    cycles: Option<u64>,

    /// Workload names. Specify multiple times for multiple workloads.
    #[clap(short = 'w', long = "workload", num_args = 1..)]
    workloads: Vec<String>,

    /// Do not run the CPU scheduler.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_scheduler: bool,

    /// Seed all random number generators for a reproducible run.
    #[clap(short = 's', long, env = "SCX_ADAPTIVE_SEED")]
    seed: Option<u64>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(input) => Config::parse(input)?,
            None => Config::default(),
        };

        if let Some(budget) = self.budget {
            config.allocator.total_memory_budget = budget;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(cycles) = self.cycles {
            config.cycles = cycles;
        }
        if !self.workloads.is_empty() {
            config.workloads = self.workloads.clone();
        }
        if self.no_scheduler {
            config.run_scheduler = false;
        }
        if let Some(seed) = self.seed {
            config.workload.seed = Some(seed);
            config.allocator.seed = Some(seed);
        }

        config.validate()?;
        Ok(config)
    }
}

struct Metrics {
    grow: Counter,
    shrink: Counter,
    jitter: Counter,
    scale_down: Counter,
    skip_grow: Counter,
    skip_shrink: Counter,
    quantum_grants: Counter,
    quantum_ms: Histogram,
    processing_duration: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            grow: counter!("allocations_total", "type" => "grow"),
            shrink: counter!("allocations_total", "type" => "shrink"),
            jitter: counter!("allocations_total", "type" => "jitter"),
            scale_down: counter!("allocations_total", "type" => "scale_down"),
            skip_grow: counter!("allocation_skips_total", "type" => "grow"),
            skip_shrink: counter!("allocation_skips_total", "type" => "shrink"),
            quantum_grants: counter!("quantum_grants_total"),
            quantum_ms: histogram!("quantum_ms"),
            processing_duration: histogram!("allocation_duration_us"),
        }
    }

    fn record(&self, event: &Event) {
        match event {
            Event::Grow { .. } => self.grow.increment(1),
            Event::Shrink { .. } => self.shrink.increment(1),
            Event::Jitter { .. } => self.jitter.increment(1),
            Event::ScaleDown { .. } => self.scale_down.increment(1),
            Event::SkipGrow { .. } => self.skip_grow.increment(1),
            Event::SkipShrink { .. } => self.skip_shrink.increment(1),
            Event::QuantumGranted { quantum, .. } => {
                self.quantum_grants.increment(1);
                self.quantum_ms.record(quantum.as_secs_f64() * 1000.0);
            }
            Event::BudgetSummary { used, remaining, .. } => {
                gauge!("memory_used_mb").set(*used);
                gauge!("memory_remaining_mb").set(*remaining);
            }
            Event::CpuObserved { workload, cpu_usage } => {
                gauge!("workload_cpu_pct", "workload" => workload.clone()).set(*cpu_usage);
            }
            Event::WorkloadStarted { .. } | Event::WorkloadStopped { .. } => {}
        }
    }
}

/// Presentation side of the event stream. Exits once every sender is gone.
fn report_events(rx: Receiver<Event>) {
    let metrics = Metrics::new();
    let log_sink = LogSink;
    for event in rx.iter() {
        metrics.record(&event);
        log_sink.emit(event);
    }
}

fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    let (tx, rx) = crossbeam::channel::unbounded();
    let reporter = thread::Builder::new()
        .name("reporter".into())
        .spawn(move || report_events(rx))
        .context("Failed to spawn reporter thread")?;
    let sink: SharedSink = Arc::new(ChannelSink::new(tx));

    let mut rng = match config.workload.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let workloads = Arc::new(WorkloadSet::from_names(
        &config.workloads,
        &config.workload,
        &mut rng,
        sink.clone(),
    )?);

    let mut allocator = Allocator::new(workloads.clone(), config.allocator.clone(), sink.clone())?;
    let scheduler = Arc::new(Scheduler::new(
        workloads.clone(),
        config.scheduler.clone(),
        sink.clone(),
    )?);

    let mut sampler = ProcSampler::new()?;
    let mut history = History::new(config.history_len);
    let interval = config.interval_duration()?;
    let started_at = Instant::now();

    workloads.start_all()?;
    let sched_thread = if config.run_scheduler {
        let sched = scheduler.clone();
        Some(
            thread::Builder::new()
                .name("scheduler".into())
                .spawn(move || sched.run())
                .context("Failed to spawn scheduler thread")?,
        )
    } else {
        None
    };

    let metrics = Metrics::new();
    let mut cycle = 0;
    let result = (|| -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) && (config.cycles == 0 || cycle < config.cycles) {
            let now = Instant::now();
            let stats = allocator.allocate();
            metrics
                .processing_duration
                .record(now.elapsed().as_micros() as f64);

            match sampler.sample() {
                Ok(sample) => {
                    info!(
                        "host cpu={:6.2}% mem={:6.2}%",
                        sample.cpu_pct, sample.mem_pct
                    );
                    history.push(sample);
                }
                Err(e) => warn!("Failed to sample host: {:#}", e),
            }

            let mut out = Vec::new();
            stats.format(&mut out)?;
            format_workloads(&mut out, &workloads.snapshots())?;
            history.summary(started_at.elapsed()).format(&mut out)?;
            info!("\n{}", String::from_utf8_lossy(&out).trim_end());

            cycle += 1;
            thread::sleep(interval.saturating_sub(now.elapsed()));
        }
        Ok(())
    })();

    info!("Stopping workloads...");
    workloads.stop_all();
    workloads.join_all();
    scheduler.stop();
    if let Some(handle) = sched_thread {
        if handle.join().is_err() {
            warn!("scheduler thread panicked");
        }
    }

    drop(allocator);
    drop(scheduler);
    drop(workloads);
    drop(sink);
    if reporter.join().is_err() {
        warn!("reporter thread panicked");
    }

    let mut out = Vec::new();
    history.summary(started_at.elapsed()).format(&mut out)?;
    std::io::stdout().write_all(&out)?;
    info!("All workloads stopped.");
    result
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = opts.config()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    run(config, shutdown)
}
