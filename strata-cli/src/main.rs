//! Strata CLI - drive the storage engine from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use strata_core::tsfile::TsFileSequenceReader;
use strata_core::{EngineConfig, StorageEngine, TsValue};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - time-series write path and compaction engine")]
#[command(version = strata_core::VERSION)]
struct Cli {
    /// JSON configuration file; missing keys take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic workload
    Ingest {
        /// Storage group the devices live under
        #[arg(long, default_value = "root.demo")]
        storage_group: String,
        #[arg(long, default_value_t = 10)]
        devices: usize,
        #[arg(long, default_value_t = 4)]
        measurements: usize,
        /// Points per series
        #[arg(long, default_value_t = 10_000)]
        points: usize,
        /// Milliseconds between consecutive points
        #[arg(long, default_value_t = 1_000)]
        step: i64,
        /// Share of points written with an earlier timestamp
        #[arg(long, default_value_t = 0.0)]
        out_of_order: f64,
        /// Seal every open file afterwards
        #[arg(long)]
        close: bool,
    },
    /// Run one compaction tick over every partition and wait for it
    Compact {
        /// Seconds to wait for the submitted tasks
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Print the chunk groups and series statistics of a file
    Inspect {
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Ingest {
            storage_group,
            devices,
            measurements,
            points,
            step,
            out_of_order,
            close,
        } => ingest(
            config,
            &storage_group,
            devices,
            measurements,
            points,
            step,
            out_of_order,
            close,
        ),
        Commands::Compact { timeout } => compact(config, Duration::from_secs(timeout)),
        Commands::Inspect { file } => inspect(&file),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ingest(
    config: EngineConfig,
    storage_group: &str,
    devices: usize,
    measurements: usize,
    points: usize,
    step: i64,
    out_of_order: f64,
    close: bool,
) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&out_of_order),
        "--out-of-order must lie in [0, 1]"
    );
    let engine = StorageEngine::open(config)?;
    let mut rng = rand::thread_rng();
    let names: Vec<String> = (0..measurements).map(|m| format!("s{}", m)).collect();
    let started = Instant::now();

    for i in 0..points {
        for d in 0..devices {
            let device = format!("{}.d{}", storage_group, d);
            let mut time = i as i64 * step;
            if i > 0 && rng.gen_bool(out_of_order) {
                time = rng.gen_range(0..i as i64) * step;
            }
            let values: Vec<(String, TsValue)> = names
                .iter()
                .map(|name| (name.clone(), TsValue::Double(rng.gen_range(0.0..100.0))))
                .collect();
            engine.insert_record(&device, time, &values)?;
        }
    }
    engine.flush_all()?;
    if close {
        engine.close_all()?;
    }

    let total = points * devices * measurements;
    let elapsed = started.elapsed();
    info!(
        "Ingested {} points in {:.2}s ({:.0} points/s)",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    engine.shutdown()?;
    Ok(())
}

fn compact(config: EngineConfig, timeout: Duration) -> Result<()> {
    let engine = StorageEngine::open(config)?;
    let submitted = engine.schedule_compaction();
    info!("Submitted {} compaction tasks", submitted);
    if !engine.wait_compaction_idle(timeout) {
        anyhow::bail!("compaction did not finish within {:?}", timeout);
    }

    let stats = engine.context().task_manager().stats();
    println!(
        "submitted: {}, completed: {}, failed: {}",
        submitted, stats.completed, stats.failed
    );
    for name in engine.storage_groups() {
        if let Some(group) = engine.storage_group(&name) {
            for management in group.managements() {
                println!(
                    "{}[{}]: {} sequence, {} unsequenced files",
                    name,
                    management.partition(),
                    management.size(true),
                    management.size(false)
                );
            }
        }
    }
    engine.shutdown()?;
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let reader = TsFileSequenceReader::open(file)
        .with_context(|| format!("opening {:?}", file))?;
    let metadata = reader.metadata();
    println!("file: {:?}", reader.path());
    println!("size: {} bytes", reader.file_size());
    println!(
        "chunks: {} ({} invalid), versions: {:?}",
        metadata.total_chunk_num,
        metadata.invalid_chunk_num,
        metadata.version_info.iter().map(|(_, v)| *v).collect::<Vec<_>>()
    );

    println!("chunk groups:");
    for group in reader.scan_chunk_groups()? {
        println!(
            "  {}: {} chunks, {} bytes",
            group.device,
            group.chunks.len(),
            group.data_size
        );
    }

    println!("series:");
    for (path, series) in reader.all_timeseries_metadata()? {
        let stats = &series.statistics;
        println!(
            "  {} ({}): count={} time=[{}, {}] min={} max={}",
            path,
            series.data_type,
            stats.count(),
            stats.start_time(),
            stats.end_time(),
            stats.min_value().map_or_else(|| "-".to_string(), |v| v.to_string()),
            stats.max_value().map_or_else(|| "-".to_string(), |v| v.to_string()),
        );
    }
    Ok(())
}
