//! Two-tier series
//!
//! A [`TieredSeries`] puts an in-memory cache series in front of a persisted
//! archive series. Frames go into the cache; every chunk the cache closes is
//! handed to the archive as one element, so each archive chunk is made of
//! whole cache chunks. Each tier trims to its own policy.
//!
//! ```text
//! add_element → cache chunk → close → archive element → archive chunk → flush → trim
//! ```
//!
//! Lock order: cache door, then archive door.

use crate::query::{
    DataExtractor, MatchStatus, ReferenceMode, RequestDescriptor, ResponseMode,
    TimeRelativeMatch, TimeRelativeQuery, Window,
};
use crate::storage::catalog::TimeRangeCatalog;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::series::{
    catalog_limits, resolve_reference, ChunkSeries, SeriesConfig, SeriesStats,
};
use crate::storage::types::Frame;
use serde::Serialize;
use std::sync::Arc;

/// Construction parameters of a [`TieredSeries`]
#[derive(Debug, Clone)]
pub struct TieredConfig {
    /// The in-memory tier; must not name an archive directory
    pub cache: SeriesConfig,
    /// The tier closed cache chunks move into; `None` runs the cache alone
    pub archive: Option<SeriesConfig>,
}

impl TieredConfig {
    pub fn new(cache: SeriesConfig) -> Self {
        Self { cache, archive: None }
    }

    /// Builder method: hand closed cache chunks to a series built from `archive`
    pub fn archive(mut self, archive: SeriesConfig) -> Self {
        self.archive = Some(archive);
        self
    }
}

/// Statistics of both tiers
#[derive(Debug, Clone, Serialize)]
pub struct TieredStats {
    pub cache: SeriesStats,
    pub archive: Option<SeriesStats>,
}

impl std::fmt::Display for TieredStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cache)?;
        if let Some(archive) = &self.archive {
            write!(f, "\n{}", archive)?;
        }
        Ok(())
    }
}

/// In-memory cache series cascading into an archive series
#[derive(Debug)]
pub struct TieredSeries {
    cache: Arc<ChunkSeries>,
    archive: Option<Arc<ChunkSeries>>,
}

impl TieredSeries {
    /// Open the archive tier (recovering what it holds on disk), then the cache on top of it.
    pub async fn open(config: TieredConfig) -> StorageResult<Self> {
        if config.cache.archive_dir.is_some() {
            return Err(StorageError::Config(format!(
                "cache tier {} must stay in memory",
                config.cache.name
            )));
        }
        let archive = match config.archive {
            Some(archive) => Some(ChunkSeries::open(archive).await?),
            None => None,
        };
        let cache = ChunkSeries::open_tier(config.cache, archive.clone()).await?;
        tracing::info!(
            "Opened tiered series {}{}",
            cache.name(),
            archive
                .as_ref()
                .map(|a| format!(" over {}", a.name()))
                .unwrap_or_default()
        );
        Ok(Self { cache, archive })
    }

    pub fn cache(&self) -> &Arc<ChunkSeries> {
        &self.cache
    }

    pub fn archive(&self) -> Option<&Arc<ChunkSeries>> {
        self.archive.as_ref()
    }

    pub async fn add_element(&self, frame: Frame) -> StorageResult<()> {
        self.cache.add_element(frame).await
    }

    /// Close the open cache chunk, moving it into the archive.
    pub async fn close_current(&self) -> StorageResult<()> {
        self.cache.close_current().await
    }

    /// Locate the reference in the cache, falling back to the archive for
    /// times older than anything the cache still holds.
    pub async fn match_time_relative(
        &self,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        let found = self.cache.match_time_relative(query).await?;
        let Some(archive) = &self.archive else {
            return Ok(found);
        };
        if found.status != MatchStatus::Before {
            return Ok(found);
        }

        let older = archive.match_time_relative(query).await?;
        if older.status != MatchStatus::After {
            return Ok(older);
        }
        // Past the archived data but short of the cache's: a gap between tiers.
        if query.relationship.looks_back() {
            return archive.before_time_relative(query).await;
        }
        let newer = self.cache.after_time_relative(query).await?;
        Ok(if newer.is_exact() {
            newer
        } else {
            TimeRelativeMatch::after()
        })
    }

    /// Collect the samples inside `window` from whichever tiers hold them.
    pub async fn extract(&self, window: Window, mode: ResponseMode) -> StorageResult<DataExtractor> {
        let Some(archive) = &self.archive else {
            return self.cache.extract(window, mode).await;
        };
        let cached = self.cache.catalog().await.trange();
        if cached.is_some_and(|span| window.start >= span.start) {
            return self.cache.extract(window, mode).await;
        }

        // The archive holds every closed cache chunk; only the open one is missing.
        let mut pending = window.channels.clone();
        let mut extractor = DataExtractor::new(window, mode);
        archive.move_down_from(&mut extractor, &mut pending).await?;
        self.cache
            .move_down_current(&mut extractor, &mut pending)
            .await?;
        if !pending.is_empty() {
            tracing::debug!("No data in window for {:?} of {}", pending, self.cache.name());
        }
        Ok(extractor)
    }

    /// Aggregate catalog over both tiers.
    pub async fn catalog(&self) -> TimeRangeCatalog {
        let mut merged = match &self.archive {
            Some(archive) => archive.catalog().await,
            None => TimeRangeCatalog::new(),
        };
        let cached = self.cache.catalog().await;
        merged.update_registration(&cached, false, false);
        merged
    }

    /// Resolve a request against the data of both tiers.
    pub async fn resolve_request(
        &self,
        request: &RequestDescriptor,
    ) -> StorageResult<Option<Window>> {
        request.validate()?;
        if !request.domain.includes_existing() {
            return Ok(None);
        }

        if request.reference == ReferenceMode::Absolute {
            return Ok(match request.to_time_relative_query() {
                Some(query) => self
                    .match_time_relative(&query)
                    .await?
                    .to_window(&query, request.duration),
                None => Some(
                    Window::new(request.start, request.duration)
                        .channels(request.channels.iter().cloned()),
                ),
            });
        }

        let catalog = self.catalog().await;
        Ok(catalog_limits(&catalog, &request.channels)
            .and_then(|limits| resolve_reference(request, limits)))
    }

    pub async fn stats(&self) -> TieredStats {
        TieredStats {
            cache: self.cache.stats().await,
            archive: match &self.archive {
                Some(archive) => Some(archive.stats().await),
                None => None,
            },
        }
    }

    /// Shut the cache down (moving its open chunk into the archive), then the archive.
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.cache.shutdown().await?;
        if let Some(archive) = &self.archive {
            archive.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Relationship;
    use crate::storage::disk::INDEX_FILE;
    use crate::storage::series::RetentionPolicy;
    use crate::storage::types::{Samples, TimeRange};
    use std::path::Path;
    use tempfile::tempdir;

    fn frame(start: f64, n: usize) -> Frame {
        Frame::new(TimeRange::new(start, n as f64)).channel(
            "a",
            Samples::Float64((0..n).map(|i| start + i as f64).collect()),
        )
    }

    fn capacity(max_chunks: usize, per_chunk: usize) -> RetentionPolicy {
        RetentionPolicy::Capacity {
            max_chunks,
            max_elements_per_chunk: per_chunk,
            max_bytes_per_chunk: usize::MAX,
        }
    }

    /// Cache of `cache_chunks` one-frame chunks over an archive of
    /// `archive_chunks` chunks, two cache chunks each.
    fn config(dir: &Path, cache_chunks: usize, archive_chunks: usize) -> TieredConfig {
        TieredConfig::new(
            SeriesConfig::new("cache")
                .policy(capacity(cache_chunks, 1))
                .reframe(false),
        )
        .archive(
            SeriesConfig::new("archive")
                .policy(capacity(archive_chunks, 2))
                .archive(dir)
                .reframe(false),
        )
    }

    fn query(reference: f64, relationship: Relationship) -> TimeRelativeQuery {
        TimeRelativeQuery::new(reference, relationship).channel("a")
    }

    #[tokio::test]
    async fn test_closed_cache_chunks_reach_archive() {
        let dir = tempdir().unwrap();
        let tiered = TieredSeries::open(config(dir.path(), 10, 10)).await.unwrap();
        for i in 0..4 {
            tiered.add_element(frame(i as f64 * 10.0, 10)).await.unwrap();
        }

        let stats = tiered.stats().await;
        assert_eq!(stats.cache.chunk_count, 4);
        let archive = stats.archive.unwrap();
        assert_eq!(archive.chunk_count, 2);
        assert_eq!(archive.skeleton_chunks, 2);
        assert!(dir.path().join(INDEX_FILE).exists());

        let span = tiered.archive().unwrap().catalog().await.trange().unwrap();
        assert_eq!((span.start, span.end), (0.0, 40.0));
    }

    #[tokio::test]
    async fn test_each_tier_trims_to_its_own_limit() {
        let dir = tempdir().unwrap();
        let tiered = TieredSeries::open(config(dir.path(), 2, 3)).await.unwrap();
        for i in 0..10 {
            tiered.add_element(frame(i as f64 * 10.0, 10)).await.unwrap();
        }

        let stats = tiered.stats().await;
        assert_eq!(stats.cache.chunk_count, 2);
        assert_eq!(stats.cache.oldest_index, 8);
        let archive = stats.archive.unwrap();
        assert_eq!(archive.chunk_count, 3);
        assert_eq!(archive.next_index, 5);
        assert_eq!(archive.oldest_index, 2);

        let span = tiered.catalog().await.trange().unwrap();
        assert_eq!((span.start, span.end), (40.0, 100.0));
    }

    #[tokio::test]
    async fn test_old_reference_answered_by_archive() {
        let dir = tempdir().unwrap();
        let tiered = TieredSeries::open(config(dir.path(), 2, 10)).await.unwrap();
        for i in 0..6 {
            tiered.add_element(frame(i as f64 * 10.0, 10)).await.unwrap();
        }
        // cache holds 40..60, archive 0..60
        let m = tiered
            .cache()
            .match_time_relative(&query(12.5, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);

        let m = tiered
            .match_time_relative(&query(12.5, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 13.0));

        let m = tiered
            .match_time_relative(&query(45.5, Relationship::AtOrBefore))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 45.0));

        let m = tiered
            .match_time_relative(&query(-5.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);
    }

    #[tokio::test]
    async fn test_extract_spans_both_tiers() {
        let dir = tempdir().unwrap();
        let tiered = TieredSeries::open(
            TieredConfig::new(
                SeriesConfig::new("cache")
                    .policy(capacity(1, 2))
                    .reframe(false),
            )
            .archive(
                SeriesConfig::new("archive")
                    .policy(capacity(10, 1))
                    .archive(dir.path())
                    .reframe(false),
            ),
        )
        .await
        .unwrap();
        for i in 0..5 {
            tiered.add_element(frame(i as f64 * 2.0, 2)).await.unwrap();
        }
        // closed cache chunks 0..8 are archived, 8..10 is still open in the cache
        let cache = tiered.cache().stats().await;
        assert_eq!(cache.current_index, Some(2));
        assert_eq!(cache.oldest_index, 1);

        let data = tiered
            .extract(Window::new(1.0, 9.0).channel("a"), ResponseMode::Consolidated)
            .await
            .unwrap();
        assert_eq!(
            data.column("a").unwrap().times,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );

        let oldest = tiered
            .resolve_request(&RequestDescriptor::oldest(3.0).channel("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((oldest.start, oldest.duration), (0.0, 3.0));
    }

    #[tokio::test]
    async fn test_reopen_recovers_archive_tier() {
        let dir = tempdir().unwrap();
        {
            let tiered = TieredSeries::open(config(dir.path(), 10, 10)).await.unwrap();
            for i in 0..3 {
                tiered.add_element(frame(i as f64 * 10.0, 10)).await.unwrap();
            }
            tiered.shutdown().await.unwrap();
        }

        let tiered = TieredSeries::open(config(dir.path(), 10, 10)).await.unwrap();
        assert_eq!(tiered.cache().stats().await.chunk_count, 0);
        let m = tiered
            .match_time_relative(&query(21.5, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 22.0));

        // the cache resumes after the archived data
        assert!(tiered.add_element(frame(25.0, 1)).await.is_err());
        tiered.add_element(frame(30.0, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_on_disk_rejected() {
        let dir = tempdir().unwrap();
        let err = TieredSeries::open(TieredConfig::new(
            SeriesConfig::new("cache").archive(dir.path()),
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
