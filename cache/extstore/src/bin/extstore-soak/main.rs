//! Soak test driver for the extstore engine.
//!
//! Writer threads push pattern-filled objects into round-robin buckets, read
//! every object back through the engine, verify its bytes, and delete a
//! fraction of them so maintenance has pages to reclaim. Runs until the
//! configured duration elapses or SIGINT/SIGTERM is received.

mod config;
mod logging;

use clap::Parser;
use config::{Config, WorkloadConfig};
use extstore::{Engine, ExtstoreError, IoRequest, IoResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "extstore-soak")]
#[command(about = "Soak test for the extstore page engine")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Outcomes observed across all writers and completions.
#[derive(Default)]
struct Counters {
    written: AtomicU64,
    rejected: AtomicU64,
    verified: AtomicU64,
    mismatched: AtomicU64,
    stale: AtomicU64,
    read_errors: AtomicU64,
    deleted: AtomicU64,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    let shutdown = match install_signal_handler() {
        Ok(flag) => flag,
        Err(e) => {
            error!(error = %e, "failed to install signal handler");
            std::process::exit(1);
        }
    };

    match run(config, shutdown) {
        Ok(counters) if counters.mismatched.load(Ordering::Relaxed) > 0 => {
            error!("read-back verification failed");
            std::process::exit(2);
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "soak failed");
            std::process::exit(1);
        }
    }
}

fn install_signal_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        info!("received shutdown signal, stopping writers");
    })?;

    Ok(shutdown)
}

fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<Arc<Counters>, ExtstoreError> {
    let workload = config.workload;
    let engine = Engine::new(config.engine)?;
    let counters = Arc::new(Counters::default());

    let deadline =
        (workload.duration_secs > 0).then(|| Instant::now() + Duration::from_secs(workload.duration_secs));

    info!(
        writers = workload.writers,
        object_size = %extstore::format_size(workload.object_size),
        duration_secs = workload.duration_secs,
        read_back = workload.read_back,
        delete_ratio = workload.delete_ratio,
        "starting soak"
    );

    let started = Instant::now();
    thread::scope(|scope| {
        let engine = &engine;
        let workload = &workload;
        let counters = &counters;
        let shutdown = &shutdown;
        (0..workload.writers)
            .map(|id| {
                thread::Builder::new()
                    .name(format!("soak-writer-{id}"))
                    .spawn_scoped(scope, move || {
                        writer(engine, id, workload, counters, shutdown, deadline)
                    })
                    .map(|_| ())
            })
            .collect::<std::io::Result<Vec<()>>>()
    })?;

    // drains every pending read before returning
    let stats = engine.stats();
    engine.shutdown();

    let elapsed = started.elapsed().as_secs_f64();
    let written = counters.written.load(Ordering::Relaxed);
    info!(
        elapsed_secs = elapsed,
        written,
        writes_per_sec = written as f64 / elapsed.max(f64::EPSILON),
        rejected = counters.rejected.load(Ordering::Relaxed),
        verified = counters.verified.load(Ordering::Relaxed),
        mismatched = counters.mismatched.load(Ordering::Relaxed),
        stale = counters.stale.load(Ordering::Relaxed),
        read_errors = counters.read_errors.load(Ordering::Relaxed),
        deleted = counters.deleted.load(Ordering::Relaxed),
        "soak finished"
    );
    info!(
        free = stats.free_pages,
        active = stats.active_pages,
        draining = stats.draining_pages,
        closed = stats.closed_pages,
        free_write_buffers = stats.free_write_buffers,
        "page states"
    );
    log_metrics();

    Ok(counters)
}

fn writer(
    engine: &Engine,
    id: usize,
    workload: &WorkloadConfig,
    counters: &Arc<Counters>,
    shutdown: &AtomicBool,
    deadline: Option<Instant>,
) {
    let buckets = engine.config().bucket_count;
    let mut data = vec![0u8; workload.object_size];
    let mut seq: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) && deadline.is_none_or(|d| Instant::now() < d) {
        let seed = ((id as u64) << 40) | seq;
        let bucket = (id + seq as usize) % buckets;
        seq += 1;
        fill(&mut data, seed);

        let location = match engine.write(bucket, &data) {
            Ok(location) => location,
            Err(e) if e.is_exhausted() => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(e) => {
                error!(writer = id, error = %e, "write failed");
                return;
            }
        };
        counters.written.fetch_add(1, Ordering::Relaxed);

        if workload.read_back {
            let counters = counters.clone();
            engine.read([IoRequest::read(location, move |req, result| {
                verify(&counters, &req.buf, seed, result)
            })]);
        }

        if should_delete(seq, workload.delete_ratio) {
            match engine.delete(location.page_id, location.page_version, 1) {
                Ok(()) => {
                    counters.deleted.fetch_add(1, Ordering::Relaxed);
                }
                Err(ExtstoreError::StaleVersion) => {
                    counters.stale.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(writer = id, error = %e, "delete failed"),
            }
        }
    }
}

fn verify(counters: &Counters, buf: &[u8], seed: u64, result: IoResult) {
    match result {
        Ok(n) => {
            if n == buf.len() && buf.iter().enumerate().all(|(i, &b)| b == pattern(seed, i)) {
                counters.verified.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.mismatched.fetch_add(1, Ordering::Relaxed);
                error!(seed, len = buf.len(), "read-back mismatch");
            }
        }
        Err(ExtstoreError::StaleVersion) => {
            counters.stale.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.read_errors.fetch_add(1, Ordering::Relaxed);
            warn!(seed, error = %e, "read failed");
        }
    }
}

#[inline]
fn pattern(seed: u64, index: usize) -> u8 {
    (seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as u8 ^ index as u8
}

fn fill(buf: &mut [u8], seed: u64) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = pattern(seed, i);
    }
}

/// Spreads deletes evenly: exactly `ratio` of every run of writes.
fn should_delete(seq: u64, ratio: f64) -> bool {
    (seq as f64 * ratio).floor() > ((seq - 1) as f64 * ratio).floor()
}

fn log_metrics() {
    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if !name.starts_with("extstore_") {
            continue;
        }
        match metric.value() {
            Some(metriken::Value::Counter(v)) => info!(metric = name, value = v, "counter"),
            Some(metriken::Value::Gauge(v)) => info!(metric = name, value = v, "gauge"),
            _ => {}
        }
    }
}

fn print_default_config() {
    let config = r#"# extstore soak configuration

[engine]
# Backing file; truncated on startup
path = "extstore.dat"
# Page and write buffer sizes must be multiples of 2MB, and page_size a
# multiple of write_buffer_size
page_size = "64MB"
write_buffer_size = "8MB"
page_count = 64
# Each bucket appends to its own page; must not exceed write_buffer_count
bucket_count = 4
write_buffer_count = 8
worker_threads = 1
# Items a worker takes from each queue per wake
io_batch_depth = 1

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty", "compact", or "json"
format = "pretty"

[workload]
writers = 2
object_size = "64KB"
# Seconds to run; 0 runs until interrupted
duration_secs = 10
# Read every object back and verify its bytes
read_back = true
# Fraction of objects deleted right after writing
delete_ratio = 0.5
"#;
    print!("{}", config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_delete_ratio() {
        let deletes = (1..=1000).filter(|&seq| should_delete(seq, 0.25)).count();
        assert_eq!(deletes, 250);
        assert!(!(1..=100).any(|seq| should_delete(seq, 0.0)));
        assert!((1..=100).all(|seq| should_delete(seq, 1.0)));
    }

    #[test]
    fn test_fill_matches_pattern() {
        let mut buf = vec![0u8; 300];
        fill(&mut buf, 42);
        let counters = Counters::default();
        verify(&counters, &buf, 42, Ok(buf.len()));
        assert_eq!(counters.verified.load(Ordering::Relaxed), 1);

        buf[7] ^= 0xFF;
        verify(&counters, &buf, 42, Ok(buf.len()));
        assert_eq!(counters.mismatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stale_read_counted() {
        let counters = Counters::default();
        verify(&counters, &[], 1, Err(ExtstoreError::StaleVersion));
        assert_eq!(counters.stale.load(Ordering::Relaxed), 1);
    }
}
