//! segstore - Stress Driver
//!
//! Runs a mixed put/get/remove/match workload against a segmented set from
//! several threads, with the background sweeper and a queued expiry
//! listener attached, then prints the store statistics.

use segstore::codec::{Entity, FieldKind, Schema, Template, TupleCodec, Value};
use segstore::storage::{
    ExpirationListener, ExpiredEvent, ExpiryNotifier, ExpirySweeper, QueueExecutor, SegmentedSet,
};
use segstore::{ArenaMemory, NotifierConfig, StoreConfig, SweeperConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Driver configuration
struct Config {
    /// Worker threads
    threads: usize,
    /// Operations per thread
    ops: u64,
    /// Distinct keys per thread
    keys: u64,
    /// TTL for written entries, 0 for none
    ttl_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 4,
            ops: 100_000,
            keys: 10_000,
            ttl_ms: 0,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--threads" | "-t" => config.threads = parse_value(&args, i),
                "--ops" | "-n" => config.ops = parse_value(&args, i),
                "--keys" | "-k" => config.keys = parse_value(&args, i),
                "--ttl-ms" => config.ttl_ms = parse_value(&args, i),
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("segstore version {}", segstore::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 2;
        }

        if config.threads == 0 || config.keys == 0 {
            eprintln!("Error: --threads and --keys must be positive");
            std::process::exit(1);
        }
        config
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize) -> T {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", args[i]);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", args[i], raw);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
segstore - Segmented Off-Heap Hash Set Stress Driver

USAGE:
    segstore [OPTIONS]

OPTIONS:
    -t, --threads <N>    Worker threads (default: 4)
    -n, --ops <N>        Operations per thread (default: 100000)
    -k, --keys <N>       Distinct keys per thread (default: 10000)
        --ttl-ms <MS>    TTL for written entries, 0 for none (default: 0)
    -v, --version        Print version information
        --help           Print this help message

Set RUST_LOG=debug to see segment resizes and sweeps.
"#
    );
}

/// Counts expiry events.
#[derive(Default)]
struct ExpiryCounter {
    events: AtomicU64,
}

impl ExpirationListener<Entity> for ExpiryCounter {
    fn on_expired(&self, _event: ExpiredEvent<Entity>) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

fn schema() -> Schema {
    Schema::new("Account", "id", FieldKind::Str)
        .field("owner", FieldKind::Int)
        .field("balance", FieldKind::Int)
        .field("active", FieldKind::Bool)
}

fn run_worker(set: &SegmentedSet<TupleCodec>, worker: usize, config: &Config) -> segstore::Result<u64> {
    let ttl = (config.ttl_ms > 0).then(|| Duration::from_millis(config.ttl_ms));
    let mut matched = 0u64;

    for op in 0..config.ops {
        let n = op.wrapping_mul(0x9E37_79B9_7F4A_7C15) % config.keys;
        let id = Value::from(format!("w{worker}-{n}"));
        match op % 10 {
            0..=3 => {
                let entity = Entity::new(vec![
                    id,
                    Value::Int(worker as i64),
                    Value::Int(op as i64),
                    Value::Bool(op % 2 == 0),
                ]);
                set.put_entity(&entity, ttl)?;
            }
            4..=7 => {
                set.get_bytes(&id)?;
            }
            8 => {
                set.remove(&id)?;
            }
            _ => {
                if op % 10_000 == 9 {
                    matched += set.match_bytes(&Template::by_key(id))?.len() as u64;
                } else {
                    set.contains(&id)?;
                }
            }
        }
    }
    Ok(matched)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_args());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let codec = Arc::new(TupleCodec::new(schema()));
    let listener = Arc::new(ExpiryCounter::default());
    let executor = Arc::new(QueueExecutor::start(NotifierConfig::default())?);
    let notifier =
        ExpiryNotifier::new(Arc::clone(&codec)).with_listener(listener.clone(), executor.clone());

    let mem = Arc::new(ArenaMemory::new());
    let set = Arc::new(SegmentedSet::with_parts(
        codec,
        StoreConfig::default(),
        mem.clone(),
        notifier,
    )?);
    let _sweeper = ExpirySweeper::start(Arc::clone(&set), SweeperConfig::default())?;

    info!(
        threads = config.threads,
        ops = config.ops,
        keys = config.keys,
        ttl_ms = config.ttl_ms,
        "Starting workload"
    );
    let started = Instant::now();

    let mut workers = Vec::with_capacity(config.threads);
    for worker in 0..config.threads {
        let set = Arc::clone(&set);
        let config = Arc::clone(&config);
        workers.push(tokio::task::spawn_blocking(move || {
            run_worker(&set, worker, &config)
        }));
    }

    let mut matched = 0;
    for worker in workers {
        matched += worker.await??;
    }

    let elapsed = started.elapsed();
    let total_ops = config.ops * config.threads as u64;
    let stats = set.stats();

    println!("──────────────────────────────────────────────");
    println!("operations     {total_ops} in {elapsed:?}");
    println!(
        "throughput     {:.0} ops/s",
        total_ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("entries        {}", stats.items);
    println!("bytes          {}", stats.bytes);
    println!("segments       {}", stats.segments);
    println!("matched        {matched}");
    println!("expired        {}", stats.expired);
    println!("notified       {}", listener.events.load(Ordering::Relaxed));
    println!("allocations    {}", mem.live_allocations());
    if let Some(kind) = stats.rehash_due {
        println!("rehash due     {kind:?}");
    }

    set.destroy()?;
    if mem.live_allocations() != 0 {
        warn!(leaked = mem.live_allocations(), "Blocks still allocated after destroy");
    }

    info!("Shutdown complete");
    Ok(())
}
