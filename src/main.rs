use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rsswatch::{
    allocations::{AllocationTracker, Footprint},
    correlate::{Correlated, Correlator, CorrelatorConfig},
    tracer::Probes,
    Aggregation, ArenaConfig, PageTableEngine, RssEngine, Sample, Sampler, SmapsEngine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Walk `/proc/<PID>/pagemap`, one status word per page.
    Pagemap,
    /// Read the kernel's per-VMA summary in `/proc/<PID>/smaps`.
    Smaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AggregationArg {
    Simple,
    Segments,
}

impl From<AggregationArg> for Aggregation {
    fn from(a: AggregationArg) -> Self {
        match a {
            AggregationArg::Simple => Aggregation::Simple,
            AggregationArg::Segments => Aggregation::Segments,
        }
    }
}

/// Sample the resident set of a process per VMA, optionally alongside its memory syscalls.
///
/// Samples and events are written to stdout as JSON lines; logs go to stderr.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Process to sample.
    pid: u32,

    /// How resident pages are counted.
    #[clap(long, value_enum, default_value_t = Engine::Pagemap)]
    engine: Engine,

    /// Milliseconds between the completion of a sample and the start of the next one.
    #[clap(long, default_value_t = 1000)]
    period_ms: u64,

    /// Aggregation policy of the pagemap engine.
    #[clap(long, value_enum, default_value_t = AggregationArg::Simple)]
    aggregation: AggregationArg,

    /// Stop after this many samples.
    #[clap(long)]
    samples: Option<u64>,

    /// Carry on after a failed sample, unless the target is gone.
    #[clap(long)]
    keep_going: bool,

    /// Compiled `rsswatch-ebpf` object; enables syscall capture.
    #[clap(long)]
    probes: Option<PathBuf>,

    /// Capacity of the snapshot region, in bytes.
    #[clap(long, default_value_t = ArenaConfig::DEFAULT_SNAPSHOT_BYTES)]
    snapshot_bytes: usize,

    /// Capacity of the VMA array.
    #[clap(long, default_value_t = ArenaConfig::DEFAULT_MAX_VMAS)]
    max_vmas: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Line<'a> {
    Sample(&'a Sample<'a>),
    Event(&'a Correlated),
    Footprint(&'a [Footprint]),
}

fn emit(line: &Line<'_>) {
    let out = io::stdout();
    let mut out = out.lock();
    let res = serde_json::to_writer(&mut out, line)
        .map_err(io::Error::from)
        .and_then(|()| writeln!(out));
    if let Err(e) = res {
        debug!(error = %e, "could not write to stdout");
    }
}

/// Sample until `--samples` is reached or sampling fails; returns the exit code.
fn run<E: RssEngine>(engine: E, args: &Args) -> i32 {
    let mut sampler = Sampler::new(engine, Duration::from_millis(args.period_ms));
    let mut taken = 0;
    while args.samples.map_or(true, |n| taken < n) {
        match sampler.next_sample() {
            Ok(sample) => {
                debug!(
                    vmas = sample.vmas.len(),
                    rss_pages = sample.total_rss_pages(),
                    "sample"
                );
                emit(&Line::Sample(&sample));
                taken += 1;
            }
            Err(e) if e.ends_sampling() => {
                info!(pid = args.pid, error = %e, "sampling ended");
                return e.exit_code();
            }
            Err(e) if args.keep_going => warn!(error = %e, "sample failed"),
            Err(e) => {
                error!(error = %e, "sample failed");
                return e.exit_code();
            }
        }
    }
    0
}

/// Load the probes on a thread of their own and print correlated events until `stop` is set,
/// along with the allocation footprint of every traced process once per `period`.
fn spawn_tracer(
    path: PathBuf,
    pid: u32,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let page_size = rsswatch::page_size()?;
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("rsswatch-tracer".into())
        .spawn(move || {
            let mut probes = match Probes::load(&path) {
                Ok(p) => {
                    let _ = tx.send(Ok(()));
                    p
                }
                Err(e) => {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
            };
            let mut correlator = Correlator::new(pid, CorrelatorConfig::default());
            let mut tracker = AllocationTracker::new(page_size);
            let mut last_footprint = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                let polled = probes.poll(Duration::from_millis(100), |event| {
                    correlator.observe(event, |c| {
                        tracker.observe(&c);
                        emit(&Line::Event(&c));
                    })
                });
                if let Err(e) = polled {
                    error!(error = %e, "event capture stopped");
                    break;
                }
                if last_footprint.elapsed() >= period {
                    emit(&Line::Footprint(&tracker.footprints()));
                    last_footprint = Instant::now();
                }
            }
            emit(&Line::Footprint(&tracker.footprints()));
            debug!(discarded = probes.discarded(), "tracer done");
        })
        .context("spawning the tracer thread")?;

    match rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(anyhow::anyhow!(e)).context("loading the syscall probes"),
        Err(_) => Err(anyhow::anyhow!("the tracer thread exited during setup")),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = ArenaConfig {
        snapshot_bytes: args.snapshot_bytes,
        max_vmas: args.max_vmas,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let tracer = match &args.probes {
        Some(path) => Some(spawn_tracer(
            path.clone(),
            args.pid,
            Duration::from_millis(args.period_ms),
            Arc::clone(&stop),
        )?),
        None => None,
    };

    info!(pid = args.pid, engine = ?args.engine, period_ms = args.period_ms, "sampling");
    let code = match args.engine {
        Engine::Pagemap => PageTableEngine::open(args.pid, config, args.aggregation.into())
            .map(|engine| run(engine, &args)),
        Engine::Smaps => SmapsEngine::open(args.pid, config).map(|engine| run(engine, &args)),
    }
    .unwrap_or_else(|e| {
        error!(pid = args.pid, error = %e, "could not start sampling");
        e.exit_code()
    });

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = tracer {
        if handle.join().is_err() {
            error!("tracer thread panicked");
        }
    }
    exit(code)
}
