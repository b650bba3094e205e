//! Ringstore CLI
//!
//! Command-line interface for ringstore series directories:
//! - Print a default config file
//! - Run a demo ingestion against a durable series
//! - Inspect a series directory
//! - Run a time-relative query against a series directory

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ringstore::config::{generate_default_config, Config};
use ringstore::query::{Relationship, ResponseMode, TimeRelativeQuery};
use ringstore::storage::{
    ChunkSeries, DiskChunkGroup, Frame, RetentionPolicy, Samples, SeriesConfig, Span, TimeRange,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringstore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ring-buffer time-series storage")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ingest a synthetic multi-channel stream and query it back
    Demo {
        /// Series directory (default: <data_dir>/demo)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Number of frames to ingest
        #[arg(short, long, default_value = "200")]
        frames: usize,
    },

    /// Recover a series directory and list its chunks
    Inspect {
        /// Series directory
        dir: PathBuf,
    },

    /// Recover a series directory and run a time-relative match
    Query {
        /// Series directory
        dir: PathBuf,
        /// Channels to match (repeatable)
        #[arg(long = "channel", required = true)]
        channels: Vec<String>,
        /// Reference time in seconds
        #[arg(short, long)]
        time: f64,
        /// before, at-or-before, at-or-after, after
        #[arg(short, long, default_value = "at-or-after")]
        relation: Relationship,
        /// Also extract this many seconds of data from the match
        #[arg(short, long)]
        duration: Option<f64>,
    },
}

#[derive(Serialize)]
struct ChunkRow {
    index: u64,
    phase: String,
    frames: usize,
    channels: Vec<String>,
    span: Option<Span>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config);

    match cli.command {
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {:?}", path))?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }

        Commands::Demo { dir, frames } => {
            let mut series_config = config.series_config("demo")?;
            if let Some(dir) = dir {
                series_config = series_config.archive(dir);
            }
            demo(series_config, frames).await?;
        }

        Commands::Inspect { dir } => {
            let series = open_existing(&dir).await?;
            let mut rows = Vec::new();
            for chunk in series.chunks().await {
                let summary = chunk.summary().await.unwrap_or_default();
                rows.push(ChunkRow {
                    index: chunk.index(),
                    phase: format!("{:?}", chunk.phase().await),
                    frames: chunk.frame_count().await,
                    channels: summary.channels().map(str::to_string).collect(),
                    span: summary.trange(),
                });
            }
            let stats = series.stats().await;

            match cli.format.as_str() {
                "json" => {
                    let body = serde_json::json!({ "stats": stats, "chunks": rows });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                _ => {
                    println!("{}", stats);
                    println!("{:>8}  {:<10}  {:>24}  CHANNELS", "INDEX", "PHASE", "TIME");
                    for row in rows {
                        let time = row
                            .span
                            .map(|s| format!("{:.3}..{:.3}", s.start, s.end))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:>8}  {:<10}  {:>24}  {}",
                            row.index,
                            row.phase,
                            time,
                            row.channels.join(",")
                        );
                    }
                }
            }
        }

        Commands::Query {
            dir,
            channels,
            time,
            relation,
            duration,
        } => {
            let series = open_existing(&dir).await?;
            let query = TimeRelativeQuery::new(time, relation).channels(channels);
            let found = series.match_time_relative(&query).await?;

            let extracted = match (duration, found.to_window(&query, duration.unwrap_or(0.0))) {
                (Some(_), Some(window)) => Some(
                    series
                        .extract(window, ResponseMode::Consolidated)
                        .await?
                        .finish(),
                ),
                _ => None,
            };

            match cli.format.as_str() {
                "json" => {
                    let body = serde_json::json!({
                        "status": found.status.code(),
                        "time": found.time,
                        "invert": found.invert,
                        "data": extracted,
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                _ => {
                    println!(
                        "{} {}: status {} ({:?}), time {:.6}, invert {}",
                        relation,
                        time,
                        found.status.code(),
                        found.status,
                        found.time,
                        found.invert
                    );
                    if let Some(data) = extracted {
                        println!("{:#?}", data);
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("ringstore={}", config.logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Open a series directory for reading without trimming any recovered chunk.
async fn open_existing(dir: &Path) -> anyhow::Result<Arc<ChunkSeries>> {
    if !DiskChunkGroup::exists(dir) {
        bail!("{:?} does not hold a series", dir);
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "series".to_string());
    let config = SeriesConfig::new(name)
        .policy(RetentionPolicy::Capacity {
            max_chunks: usize::MAX,
            max_elements_per_chunk: usize::MAX,
            max_bytes_per_chunk: usize::MAX,
        })
        .archive(dir);
    ChunkSeries::open(config)
        .await
        .with_context(|| format!("recovering {:?}", dir))
}

async fn demo(config: SeriesConfig, frames: usize) -> anyhow::Result<()> {
    tracing::info!("Ringstore v{} demo", env!("CARGO_PKG_VERSION"));
    let series = ChunkSeries::open(config).await?;

    // One frame per second of wall-clock-anchored time, 10 samples each.
    // Resume after recovered data; frames may not go back in time.
    let recovered_end = series.catalog().await.trange().map_or(f64::MIN, |s| s.end);
    let base = (chrono::Utc::now().timestamp() as f64).max(recovered_end.ceil());
    for i in 0..frames {
        let start = base + i as f64;
        let phase = i as f64 * std::f64::consts::PI / 30.0;
        let frame = Frame::new(TimeRange::new(start, 1.0))
            .channel(
                "station/temp",
                Samples::Float64((0..10).map(|k| 20.0 + (phase + k as f64 * 0.01).sin()).collect()),
            )
            .channel(
                "station/pressure",
                Samples::Float64((0..10).map(|k| 1013.0 + (phase - k as f64 * 0.01).cos()).collect()),
            )
            .channel("station/count", Samples::Int64((0..10).map(|k| (i * 10 + k) as i64).collect()));
        series.add_element(frame).await?;
    }
    series.close_current().await?;
    tracing::info!("{}", series.stats().await);

    let middle = base + frames as f64 / 2.0 + 0.25;
    for relation in [Relationship::AtOrBefore, Relationship::AtOrAfter] {
        let query = TimeRelativeQuery::new(middle, relation).channel("station/temp");
        let found = series.match_time_relative(&query).await?;
        tracing::info!(
            "{} {:.2}: status {}, time {:.2}",
            relation,
            middle - base,
            found.status.code(),
            found.time - base
        );
        if let Some(window) = found.to_window(&query, 0.5) {
            let data = series.extract(window, ResponseMode::Consolidated).await?;
            if let Some(column) = data.column("station/temp") {
                tracing::info!("  extracted {} samples", column.len());
            }
        }
    }

    series.shutdown().await?;
    tracing::info!("Demo complete");
    Ok(())
}
