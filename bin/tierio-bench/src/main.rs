//! tierio bench - placement, Put/Get and organizer benchmarks
//!
//! Runs whole nodes in one process; multi-node runs talk through the
//! loopback transport.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tierio_common::config::{DeviceConfig, DeviceKind, SwapConfig};
use tierio_common::{Config, KIB, MIB, NoTransport, PlacementContext, PlacementPolicy};
use tierio_core::{LoopbackTransport, PutOptions, PutStatus, TierNode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierio-bench")]
#[command(about = "tierio buffering benchmarks")]
#[command(version)]
struct Args {
    /// Node configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Placement policy; every policy is measured when unset
    #[arg(long)]
    policy: Option<PlacementPolicy>,

    /// Blob size in KiB
    #[arg(long, default_value_t = 64)]
    blob_kib: u64,

    /// Number of operations
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Placement decisions per second
    Dpe {
        /// Blobs placed per call
        #[arg(long, default_value_t = 16)]
        batch: usize,
    },
    /// Put then Get throughput
    Put {
        /// Nodes in the loopback cluster
        #[arg(long, default_value_t = 1)]
        nodes: u32,
    },
    /// Cost of organize passes after filling the fastest tier
    Borg {
        /// Upper bound on passes
        #[arg(long, default_value_t = 16)]
        passes: usize,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    tierio: Config,
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Three RAM-backed tiers with falling bandwidth and RAM swap
fn default_config() -> Config {
    Config {
        devices: vec![
            DeviceConfig::ram("dram", 64 * MIB, 4 * KIB),
            DeviceConfig::ram("nvme", 256 * MIB, 4 * KIB).with_performance(2000.0, 80.0),
            DeviceConfig::ram("pfs", 1024 * MIB, 64 * KIB).with_performance(400.0, 2000.0),
        ],
        swap: SwapConfig {
            kind: DeviceKind::Ram,
            mount_point: None,
            capacity: 1024 * MIB,
        },
        ..Config::default()
    }
}

fn load_config(args: &Args) -> Result<(Config, String)> {
    let file = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<FileConfig>(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FileConfig {
            tierio: default_config(),
            logging: LoggingConfig::default(),
        },
    };
    // the command line wins over the file
    let log_level = if args.log_level == "info" {
        file.logging.level
    } else {
        args.log_level.clone()
    };
    let mut config = file.tierio;
    if config.devices.is_empty() {
        config.devices = default_config().devices;
    }
    config.borg.background = false;
    Ok((config, log_level))
}

fn policies(args: &Args) -> Vec<PlacementPolicy> {
    args.policy.map_or_else(
        || vec![PlacementPolicy::Random, PlacementPolicy::RoundRobin, PlacementPolicy::MinimizeIoTime],
        |p| vec![p],
    )
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    count as f64 / elapsed.as_secs_f64().max(f64::MIN_POSITIVE)
}

fn bench_dpe(args: &Args, config: Config, batch: usize) -> Result<()> {
    let node = TierNode::new(config, Arc::new(NoTransport))?;
    let targets = node.pool().registry().infos();
    let sizes = vec![args.blob_kib * KIB; batch];

    for policy in policies(args) {
        let ctx = PlacementContext::with_policy(policy);
        let start = Instant::now();
        let mut placed = 0;
        for _ in 0..args.iterations {
            let schemas = node.placement().placement(&sizes, &targets, &ctx)?;
            placed += schemas.len();
        }
        let elapsed = start.elapsed();
        println!(
            "{:<16} {:>10} blobs in {:>8.3}s  {:>12.0} blobs/s",
            policy.to_string(),
            placed,
            elapsed.as_secs_f64(),
            rate(placed, elapsed)
        );
    }
    Ok(())
}

fn bench_put(args: &Args, config: Config, nodes: u32) -> Result<()> {
    if nodes == 0 {
        bail!("at least one node is required");
    }
    let configs = (1..=nodes)
        .map(|n| {
            let mut c = config.clone();
            c.node.node_id = n;
            c.node.num_nodes = nodes;
            c
        })
        .collect();
    let (_transport, cluster) = LoopbackTransport::cluster(configs)?;
    let writer = cluster[0].open_bucket("bench")?;
    let reader_node = &cluster[cluster.len() - 1];
    let reader = reader_node.open_bucket("bench")?;

    let mut rng = StdRng::seed_from_u64(42);
    let mut data = vec![0u8; (args.blob_kib * KIB) as usize];
    rng.fill(data.as_mut_slice());
    let bytes = (data.len() * args.iterations) as f64 / MIB as f64;

    for policy in policies(args) {
        let options = PutOptions::with_policy(policy);
        let start = Instant::now();
        let mut swapped = 0;
        for i in 0..args.iterations {
            if writer.put(&format!("{policy}-{i}"), &data, &options)? == PutStatus::Swapped {
                swapped += 1;
            }
        }
        let put = start.elapsed();

        let start = Instant::now();
        for i in 0..args.iterations {
            let read = reader.get(&format!("{policy}-{i}"))?;
            if read.len() != data.len() {
                bail!("blob {policy}-{i} came back with {} bytes", read.len());
            }
        }
        let get = start.elapsed();
        println!(
            "{:<16} put {:>9.1} MiB/s  get {:>9.1} MiB/s  swapped {}",
            policy.to_string(),
            bytes / put.as_secs_f64().max(f64::MIN_POSITIVE),
            bytes / get.as_secs_f64().max(f64::MIN_POSITIVE),
            swapped
        );

        for i in 0..args.iterations {
            writer.delete_blob(&format!("{policy}-{i}"))?;
        }
    }

    let stats = cluster[0].pool().stats();
    info!(
        "Node 1 pool: {} allocations, {} releases, {} failed, {} swap writes",
        stats.allocations.load(Ordering::Relaxed),
        stats.releases.load(Ordering::Relaxed),
        stats.failed_allocations.load(Ordering::Relaxed),
        stats.swap_writes.load(Ordering::Relaxed)
    );
    Ok(())
}

fn bench_borg(args: &Args, mut config: Config, passes: usize) -> Result<()> {
    if let Some(fastest) = config.devices.first_mut() {
        fastest.borg_capacity_thresh = Some([0.0, 0.5]);
    }
    let node = TierNode::new(config, Arc::new(NoTransport))?;
    let bucket = node.open_bucket("borg")?;
    let mut rng = StdRng::seed_from_u64(7);
    let data = vec![0xa5u8; (args.blob_kib * KIB) as usize];

    let fastest = PutOptions::with_policy(PlacementPolicy::MinimizeIoTime);
    for i in 0..args.iterations {
        let options = fastest.clone().with_user_score(rng.gen_range(0.0..1.0));
        bucket.put(&format!("blob-{i}"), &data, &options)?;
    }

    let mut total = 0;
    let start = Instant::now();
    for pass in 1..=passes {
        let pass_start = Instant::now();
        let report = node.organize()?;
        println!(
            "pass {:>3}: {:>5} demotions {:>5} promotions {:>5} relocations in {:>8.3}ms",
            pass,
            report.demotions,
            report.promotions,
            report.relocations,
            pass_start.elapsed().as_secs_f64() * 1000.0
        );
        total += report.moves();
        if report.moves() == 0 {
            break;
        }
    }
    let stats = node.organizer().stats();
    println!(
        "{} moves in {:.3}s ({} failed)",
        total,
        start.elapsed().as_secs_f64(),
        stats.failed_moves.load(Ordering::Relaxed)
    );
    for target in node.pool().registry().infos() {
        println!("{}: {:.1}% used", target.id, target.utilization() * 100.0);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (config, log_level) = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tierio bench: {:?}", args.mode);
    match args.mode {
        Mode::Dpe { batch } => bench_dpe(&args, config, batch),
        Mode::Put { nodes } => bench_put(&args, config, nodes),
        Mode::Borg { passes } => bench_borg(&args, config, passes),
    }
}
