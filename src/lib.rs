//! # Ringstore
//!
//! Ring-buffer time-series storage: frames of multi-channel samples are grouped
//! into chunks, chunks into series, and each series retains a bounded window of
//! recent data in memory and, optionally, on disk.
//!
//! ## Features
//!
//! - **Bounded retention**: capacity (chunk count) or time-horizon trimming
//! - **Two tiers**: an in-memory cache that moves closed chunks into a persisted archive
//! - **Durability**: closed chunks are flushed to a checksummed disk group and
//!   recovered on reopen
//! - **Time-relative queries**: locate the sample before/at/after any instant
//!   across chunk boundaries
//! - **Extraction**: windows of samples per channel, consolidated or frame by frame
//!
//! ## Modules
//!
//! - [`storage`]: chunks, series and the on-disk chunk group
//! - [`query`]: time-relative queries, request descriptors and extractors
//! - [`config`]: file and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ringstore::query::{RequestDescriptor, ResponseMode};
//! use ringstore::storage::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let series = ChunkSeries::open(
//!         SeriesConfig::new("sensor").policy(RetentionPolicy::Capacity {
//!             max_chunks: 8,
//!             max_elements_per_chunk: 100,
//!             max_bytes_per_chunk: 1 << 20,
//!         }),
//!     )
//!     .await?;
//!
//!     for i in 0..1000 {
//!         let frame = Frame::new(TimeRange::new(i as f64, 1.0))
//!             .channel("sensor/value", Samples::Float64(vec![i as f64]));
//!         series.add_element(frame).await?;
//!     }
//!
//!     // Last 10 seconds of data
//!     let request = RequestDescriptor::newest(10.0).channel("sensor/value");
//!     if let Some(window) = series.resolve_request(&request).await? {
//!         let data = series.extract(window, ResponseMode::Consolidated).await?;
//!         println!("{:?}", data.column("sensor/value"));
//!     }
//!
//!     series.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    Chunk, ChunkSeries, DiskChunkGroup, Frame, RetentionPolicy, Samples, SeriesConfig,
    SeriesStats, Span, StorageError, StorageResult, TieredConfig, TieredSeries, TimeRange,
    TimeRangeCatalog,
};

pub use query::{
    DataExtractor, Extractor, MatchStatus, Relationship, RequestDescriptor, ResponseMode,
    TimeRelativeMatch, TimeRelativeQuery, Window,
};

pub use config::{Config, ConfigError, LoggingConfig, PolicyKind, SeriesSection, StorageSection};
