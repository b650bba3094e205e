//! Ringstore storage engine
//!
//! - **types**: spans, time ranges, samples and frames
//! - **catalog**: per-channel time-range catalogs
//! - **door**: labelled async locks and file locks
//! - **compression**: sample codecs (delta + LZ4)
//! - **disk**: the on-disk chunk group (header, data, registry and index files)
//! - **chunk**: one chunk of frames and its lifecycle
//! - **series**: the ordered chunk sequence of one data source
//! - **tiered**: an in-memory cache series cascading into a persisted archive series
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Frame → current Chunk → close → flush to DiskChunkGroup → skeleton → trim
//!   (tiered) cache Chunk → close → archive element → archive Chunk → flush → trim
//!
//! Read Path:
//!   TimeRelativeQuery → series catalog → binary search over chunks → load frames → Extractor
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::query::{Relationship, ResponseMode, TimeRelativeQuery, Window};
//! use ringstore::storage::{ChunkSeries, Frame, Samples, SeriesConfig, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let series = ChunkSeries::open(SeriesConfig::new("station").archive("./data/station")).await?;
//!
//!     series
//!         .add_element(
//!             Frame::new(TimeRange::new(0.0, 10.0))
//!                 .channel("temp", Samples::Float64(vec![20.0; 10])),
//!         )
//!         .await?;
//!
//!     let query = TimeRelativeQuery::new(4.5, Relationship::AtOrAfter).channel("temp");
//!     let found = series.match_time_relative(&query).await?;
//!     if let Some(window) = found.to_window(&query, 2.0) {
//!         let data = series.extract(window, ResponseMode::Consolidated).await?;
//!         println!("{:?}", data.column("temp"));
//!     }
//!
//!     series.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod chunk;
pub mod compression;
pub mod disk;
pub mod door;
pub mod error;
pub mod series;
pub mod tiered;
pub mod types;

pub use catalog::{CatalogSource, ChannelLimits, TimeRangeCatalog};
pub use chunk::{Chunk, ChunkContext, ChunkPhase, Location};
pub use compression::{compress_samples, compression_stats, decompress_samples, CompressionStats};
pub use disk::{DiskChunkGroup, DiskOffsets, IndexRecord, LoadMode, LoadedChunk, SyncMode};
pub use door::{Door, DoorHeld};
pub use error::{StorageError, StorageResult};
pub use series::{ChunkSeries, RetentionPolicy, SeriesConfig, SeriesStats};
pub use tiered::{TieredConfig, TieredSeries, TieredStats};
pub use types::{Frame, FrameRange, SampleKind, Samples, Span, TimeRange};
