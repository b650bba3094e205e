//! Chunk series
//!
//! A [`ChunkSeries`] is the ordered, policy-governed sequence of chunks holding
//! the data of one source. Exactly one chunk (the current one) accepts frames;
//! when it fills up, or when the background task's flush interval elapses, it is
//! closed, flushed to the series' [`DiskChunkGroup`] when the series persists,
//! reduced to a skeleton, and the retention policy trims the oldest chunks.
//!
//! ```text
//! add_element → current chunk → (budget reached) reframe → close → flush → skeleton → trim
//! match_time_relative → aggregate catalog limits → binary search over chunks → boundary step
//! ```
//!
//! Lock order: series door, then chunk door, then the disk group's files.

use crate::query::{
    DataExtractor, Extractor, MatchReason, MatchStatus, ReferenceMode, RequestDescriptor,
    ResponseMode, TimeRelativeMatch, TimeRelativeQuery, Window,
};
use crate::storage::catalog::TimeRangeCatalog;
use crate::storage::chunk::{registration_stamp, Chunk, ChunkContext};
use crate::storage::disk::{DiskChunkGroup, LoadMode, SyncMode};
use crate::storage::door::Door;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Frame, Span};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// How a series bounds what it retains. Fixed for the life of the series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetentionPolicy {
    /// Close chunks by size, keep at most `max_chunks` of them
    Capacity {
        max_chunks: usize,
        max_elements_per_chunk: usize,
        max_bytes_per_chunk: usize,
    },
    /// Close chunks every `flush_interval`, keep `trim_horizon` worth of data
    Time {
        flush_interval: Duration,
        trim_horizon: Duration,
    },
}

impl RetentionPolicy {
    pub fn validate(&self) -> StorageResult<()> {
        match self {
            RetentionPolicy::Capacity {
                max_elements_per_chunk,
                max_bytes_per_chunk,
                ..
            } => {
                if *max_elements_per_chunk == 0 || *max_bytes_per_chunk == 0 {
                    return Err(StorageError::Config(
                        "chunk element and byte budgets must be positive".to_string(),
                    ));
                }
            }
            RetentionPolicy::Time { flush_interval, .. } => {
                if flush_interval.is_zero() {
                    return Err(StorageError::Config(
                        "flush interval must be positive under the time policy".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Capacity {
            max_chunks: 10,
            max_elements_per_chunk: 1000,
            max_bytes_per_chunk: 1024 * 1024,
        }
    }
}

/// Construction parameters of a [`ChunkSeries`]
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub name: String,
    pub policy: RetentionPolicy,
    /// Directory of the disk group; `None` keeps the series in memory only
    pub archive_dir: Option<PathBuf>,
    pub sync_mode: SyncMode,
    /// Attempt columnar compaction of chunks before closing them
    pub reframe: bool,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            name: "series".to_string(),
            policy: RetentionPolicy::default(),
            archive_dir: None,
            sync_mode: SyncMode::default(),
            reframe: true,
        }
    }
}

impl SeriesConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder method: set the retention policy
    pub fn policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder method: persist chunks under `dir`
    pub fn archive(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Builder method: set the sync mode
    pub fn sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Builder method: enable or disable reframing
    pub fn reframe(mut self, reframe: bool) -> Self {
        self.reframe = reframe;
        self
    }
}

#[derive(Debug, Default)]
struct SeriesState {
    /// In index order; the current chunk, when present, is last
    chunks: Vec<Arc<Chunk>>,
    current: Option<Arc<Chunk>>,
    next_index: u64,
    /// Frames stored in the current chunk
    frames_added: usize,
    registered: TimeRangeCatalog,
    /// Position of the first chunk not yet merged into `registered`
    added_since: Option<usize>,
    /// Chunks were removed or replaced; `registered` must be rebuilt
    removed_any: bool,
    last_registration: u64,
    oldest_index: u64,
    /// End of the newest stored data; later elements may not start before it
    last_end: Option<f64>,
    shut_down: bool,
}

impl SeriesState {
    fn mark_added(&mut self, position: usize) {
        self.added_since = Some(self.added_since.map_or(position, |p| p.min(position)));
    }

    fn limits_of(&self, channels: &BTreeSet<String>) -> Option<Span> {
        catalog_limits(&self.registered, channels)
    }

    /// Reject an element starting before the end of what is already stored.
    fn check_order(&self, series: &str, span: Span) -> StorageResult<()> {
        match self.last_end {
            Some(last_end) if starts_before(last_end, span.start) => {
                tracing::warn!(
                    "Rejected frame for {}: starts at {} before the end of the previous frame ({})",
                    series,
                    span.start,
                    last_end
                );
                Err(StorageError::InvalidFrame(format!(
                    "frame starts at {} before the end of the previous frame ({}) in {}",
                    span.start, last_end, series
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Relative slack allowed when comparing a frame start with the previous end.
const ORDER_TOLERANCE: f64 = 1e-14;

fn starts_before(last_end: f64, start: f64) -> bool {
    last_end > start && last_end - last_end.abs() * ORDER_TOLERANCE > start
}

/// Outer bounds of `channels` in `catalog`; every channel when the set is empty.
pub(crate) fn catalog_limits(
    catalog: &TimeRangeCatalog,
    channels: &BTreeSet<String>,
) -> Option<Span> {
    if channels.is_empty() {
        return catalog.trange();
    }
    channels
        .iter()
        .filter_map(|name| catalog.extract(name).bounds())
        .reduce(|acc, s| acc.union(&s))
}

/// The query itself, or a copy naming every catalogued channel when it names none.
fn with_all_channels(
    query: &TimeRelativeQuery,
    catalog: &TimeRangeCatalog,
) -> Option<TimeRelativeQuery> {
    if query.channels.is_empty() {
        Some(query.clone().channels(catalog.channels()))
    } else {
        None
    }
}

/// Window selected by a non-absolute request reference, given the outer
/// bounds of the requested channels.
pub(crate) fn resolve_reference(request: &RequestDescriptor, limits: Span) -> Option<Window> {
    let window = match request.reference {
        ReferenceMode::Absolute => Window::new(request.start, request.duration),
        ReferenceMode::Newest | ReferenceMode::Modified => Window::new(
            limits.end - request.start - request.duration,
            request.duration,
        ),
        ReferenceMode::Oldest => Window::new(limits.start + request.start, request.duration),
        ReferenceMode::After => {
            if limits.end <= request.start {
                return None;
            }
            let begin = (limits.end - request.duration).max(request.start);
            Window::new(begin, limits.end - begin)
        }
        ReferenceMode::Aligned => {
            let end = if request.duration > 0.0 {
                ((limits.end - request.start) / request.duration).floor() * request.duration
            } else {
                limits.end - request.start
            };
            Window::new(end - request.duration, request.duration)
        }
    };
    Some(window.channels(request.channels.iter().cloned()))
}

/// Statistics of a series
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub name: String,
    pub chunk_count: usize,
    pub resident_chunks: usize,
    pub skeleton_chunks: usize,
    pub current_index: Option<u64>,
    pub next_index: u64,
    pub oldest_index: u64,
    pub resident_frames: usize,
    pub channel_count: usize,
    pub span: Option<Span>,
}

impl std::fmt::Display for SeriesStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Series {}: {} chunks ({} resident, {} skeleton), Frames: {}, Channels: {}, Index: {}..{}",
            self.name,
            self.chunk_count,
            self.resident_chunks,
            self.skeleton_chunks,
            self.resident_frames,
            self.channel_count,
            self.oldest_index,
            self.next_index
        )?;
        if let Some(span) = self.span {
            write!(f, ", Time: {:.3}..{:.3}", span.start, span.end)?;
        }
        Ok(())
    }
}

/// Ordered, policy-governed sequence of chunks for one data source
pub struct ChunkSeries {
    name: String,
    policy: RetentionPolicy,
    reframe: bool,
    disk: Option<Arc<DiskChunkGroup>>,
    door: Door<SeriesState>,
    /// Next tier down: receives every chunk this series closes
    archive: Option<Arc<ChunkSeries>>,
    stop: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkSeries {
    /// Create the series, recovering chunks already in its archive directory, and
    /// start the periodic flush task when the time policy is in effect.
    pub async fn open(config: SeriesConfig) -> StorageResult<Arc<Self>> {
        Self::open_tier(config, None).await
    }

    /// Open a series whose closed chunks are handed on to `archive`.
    pub(crate) async fn open_tier(
        config: SeriesConfig,
        archive: Option<Arc<ChunkSeries>>,
    ) -> StorageResult<Arc<Self>> {
        config.policy.validate()?;
        let disk = match &config.archive_dir {
            Some(dir) => Some(Arc::new(DiskChunkGroup::open(dir, config.sync_mode)?)),
            None => None,
        };
        let (stop, stop_rx) = watch::channel(false);
        let series = Arc::new(Self {
            door: Door::new(format!("series:{}", config.name), SeriesState::default()),
            name: config.name,
            policy: config.policy,
            reframe: config.reframe,
            disk,
            archive,
            stop,
            flush_task: Mutex::new(None),
        });

        if let Some(disk) = &series.disk {
            series.recover(disk).await?;
        }
        if let Some(archive) = &series.archive {
            let floor = archive.catalog().await.trange().map(|s| s.end);
            let mut state = series.door.write("ChunkSeries::open").await;
            state.last_end = state.last_end.into_iter().chain(floor).reduce(f64::max);
        }

        if let RetentionPolicy::Time { flush_interval, .. } = series.policy {
            let handle = Self::spawn_flush_task(&series, flush_interval, stop_rx);
            *series
                .flush_task
                .lock()
                .map_err(|_| StorageError::Lock("flush task slot poisoned".to_string()))? =
                Some(handle);
        }

        tracing::info!(
            "Opened series {} ({})",
            series.name,
            if series.disk.is_some() { "persisting" } else { "memory only" }
        );
        Ok(series)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn disk(&self) -> Option<&DiskChunkGroup> {
        self.disk.as_deref()
    }

    fn context(&self) -> ChunkContext<'_> {
        ChunkContext::new(&self.name, self.disk.as_deref())
    }

    /// Rebuild the chunk list from the disk group's index.
    async fn recover(&self, disk: &DiskChunkGroup) -> StorageResult<()> {
        if !DiskChunkGroup::exists(disk.dir()) {
            return Ok(());
        }
        let mut state = self.door.write("ChunkSeries::recover").await;
        let records = disk.scan(&state)?;

        let mut skipped = 0usize;
        for record in records {
            state.next_index = state.next_index.max(record.index + 1);
            match disk.read_chunk(&state, record.index, record.offsets, LoadMode::SkeletonOnly) {
                Ok(loaded) => state.chunks.push(Arc::new(Chunk::recovered(
                    record.index,
                    record.offsets,
                    &loaded,
                ))),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("Skipping chunk {} of {}: {}", record.index, self.name, e);
                }
            }
        }
        state.chunks.sort_by_key(|c| c.index());
        state.chunks.dedup_by_key(|c| c.index());
        state.oldest_index = state
            .chunks
            .first()
            .map_or(state.next_index, |c| c.index());
        state.removed_any = true;

        Self::refresh_locked(&mut state).await;
        state.last_end = state.registered.trange().map(|s| s.end);
        self.trim_locked(&mut state).await;
        tracing::info!(
            "Recovered {} chunks of {} ({} skipped, next index {})",
            state.chunks.len(),
            self.name,
            skipped,
            state.next_index
        );
        Ok(())
    }

    fn spawn_flush_task(
        series: &Arc<Self>,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(series);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(series) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = series.close_current().await {
                    tracing::error!("Background flush of {} failed: {}", series.name, e);
                }
            }
            tracing::debug!("Flush task stopped");
        })
    }

    /// Store one frame in the current chunk, closing the chunk when its budget is used up.
    pub async fn add_element(&self, frame: Frame) -> StorageResult<()> {
        self.ingest(vec![frame]).await
    }

    /// Store a group of frames as one element. Frames must not start before
    /// the end of the data already stored; the group as a whole is checked.
    async fn ingest(&self, frames: Vec<Frame>) -> StorageResult<()> {
        let Some(span) = frames.iter().map(|f| f.time.span()).reduce(|a, b| a.union(&b)) else {
            return Ok(());
        };
        for frame in &frames {
            frame.validate()?;
        }
        let mut state = self.door.write("ChunkSeries::add_element").await;
        if state.shut_down {
            return Err(StorageError::InvalidState(format!(
                "series {} is shut down",
                self.name
            )));
        }
        state.check_order(&self.name, span)?;

        let current = match &state.current {
            Some(current) => Arc::clone(current),
            None => {
                let chunk = Arc::new(Chunk::new(state.next_index));
                state.next_index += 1;
                state.chunks.push(Arc::clone(&chunk));
                state.current = Some(Arc::clone(&chunk));
                state.frames_added = 0;
                chunk
            }
        };
        for frame in frames {
            current.store_element(frame).await?;
        }
        state.last_end = Some(state.last_end.map_or(span.end, |end| end.max(span.end)));
        state.frames_added += 1;
        let position = state.chunks.len() - 1;
        state.mark_added(position);

        if let RetentionPolicy::Capacity {
            max_elements_per_chunk,
            max_bytes_per_chunk,
            ..
        } = self.policy
        {
            // A grouped element counts once however many frames it carries.
            let budget_used = state.frames_added >= max_elements_per_chunk;
            if budget_used || current.data_size().await >= max_bytes_per_chunk {
                self.close_locked(&mut state).await?;
            }
        }
        Ok(())
    }

    /// Close the current chunk now (flushing it when the series persists).
    pub async fn close_current(&self) -> StorageResult<()> {
        let mut state = self.door.write("ChunkSeries::close_current").await;
        self.close_locked(&mut state).await
    }

    fn close_locked<'a>(
        &'a self,
        state: &'a mut SeriesState,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(mut current) = state.current.clone() else {
                return Ok(());
            };
            if current.frame_count().await == 0 {
                return Ok(());
            }

            if self.reframe {
                if let Some(reframed) = current.reframe().await {
                    let reframed = Arc::new(reframed);
                    if let Some(last) = state.chunks.last_mut() {
                        *last = Arc::clone(&reframed);
                    }
                    state.current = Some(Arc::clone(&reframed));
                    state.removed_any = true;
                    current = reframed;
                }
            }

            current.update_registration().await;
            if let Some(disk) = &self.disk {
                // On failure the chunk stays current and in memory.
                current.flush_to_disk(disk).await?;
            }
            current.close().await;
            state.current = None;
            state.frames_added = 0;

            Self::refresh_locked(state).await;
            let handed_down = match &self.archive {
                Some(_) => current.resident_frames().await,
                None => Vec::new(),
            };
            if self.disk.is_some() {
                current.reduce_to_skeleton(&mut state.registered).await;
            }
            tracing::info!("Closed chunk {} of {}", current.index(), self.name);

            self.trim_locked(state).await;

            if let Some(archive) = &self.archive {
                // Boxed: ingest may close a chunk, which lands back here one tier down.
                let ingest: Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> =
                    Box::pin(archive.ingest(handed_down));
                if let Err(e) = ingest.await {
                    tracing::error!(
                        "Archiving chunk {} of {} into {} failed: {}",
                        current.index(),
                        self.name,
                        archive.name,
                        e
                    );
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    /// Bring the aggregate catalog up to date with the chunks.
    ///
    /// Returns -1 when it was rebuilt from scratch (chunks were removed),
    /// 1 when new chunk content was merged, 0 when nothing changed.
    pub async fn update_registration(&self) -> i8 {
        let mut state = self.door.write("ChunkSeries::update_registration").await;
        Self::refresh_locked(&mut state).await
    }

    async fn refresh_locked(state: &mut SeriesState) -> i8 {
        if state.removed_any {
            let mut rebuilt = TimeRangeCatalog::new();
            for chunk in &state.chunks {
                chunk.update_registration().await;
                if let Some(summary) = chunk.summary().await {
                    rebuilt.update_registration(&summary, false, false);
                }
            }
            state.registered = rebuilt;
            state.removed_any = false;
            state.added_since = None;
            state.last_registration = registration_stamp();
            return -1;
        }

        let Some(from) = state.added_since.take() else {
            return 0;
        };
        let mut changed = false;
        for chunk in state.chunks.iter().skip(from) {
            chunk.update_registration().await;
            if chunk.last_registration().await <= state.last_registration {
                continue;
            }
            if let Some(summary) = chunk.summary().await {
                changed |= state.registered.update_registration(&summary, false, false);
            }
        }
        if changed {
            state.last_registration = registration_stamp();
            1
        } else {
            0
        }
    }

    /// Apply the retention policy.
    pub async fn trim(&self) {
        let mut state = self.door.write("ChunkSeries::trim").await;
        self.trim_locked(&mut state).await;
    }

    async fn trim_locked(&self, state: &mut SeriesState) {
        let drop_count = match self.policy {
            RetentionPolicy::Capacity { max_chunks, .. } => {
                let empty_current = match &state.current {
                    Some(current) => usize::from(current.frame_count().await == 0),
                    None => 0,
                };
                let keep = max_chunks.max(1);
                let held = state.chunks.len().saturating_sub(empty_current);
                held.saturating_sub(keep)
            }
            RetentionPolicy::Time {
                flush_interval,
                trim_horizon,
            } => {
                let horizon = trim_horizon.as_secs_f64();
                let mut accumulated = 0.0;
                let mut cut = 0usize;
                // Newest first: once the chunks after `position` already cover
                // the horizon, everything older than `position` goes.
                for (position, chunk) in state.chunks.iter().enumerate().rev() {
                    if accumulated > horizon {
                        cut = position;
                        break;
                    }
                    let duration = chunk.time_span().await.map_or(0.0, |s| s.duration());
                    // Chunks without a measurable duration cost one flush interval.
                    accumulated += if duration > 0.0 {
                        duration
                    } else {
                        flush_interval.as_secs_f64()
                    };
                }
                cut
            }
        };

        if drop_count == 0 {
            return;
        }
        let dropped: Vec<Arc<Chunk>> = state.chunks.drain(..drop_count).collect();
        for chunk in &dropped {
            chunk.clear(self.disk.as_deref()).await;
        }
        state.oldest_index = state
            .chunks
            .first()
            .map_or(state.next_index, |c| c.index());
        state.removed_any = true;
        state.added_since = None;
        tracing::info!(
            "Trimmed {} chunks from {} (oldest index now {})",
            dropped.len(),
            self.name,
            state.oldest_index
        );
    }

    async fn match_chunk(
        &self,
        chunk: &Chunk,
        ctx: &ChunkContext<'_>,
        query: &TimeRelativeQuery,
        side: Option<bool>,
    ) -> StorageResult<TimeRelativeMatch> {
        let result = match side {
            None => chunk.match_time_relative(ctx, query).await,
            Some(true) => chunk.before_time_relative(ctx, query).await,
            Some(false) => chunk.after_time_relative(ctx, query).await,
        };
        match result {
            Err(e) if e.is_format() => {
                tracing::error!(
                    "Chunk {} of {} is unreadable, treating it as missing: {}",
                    chunk.index(),
                    self.name,
                    e
                );
                Ok(TimeRelativeMatch::with_status(
                    query.relationship.boundary_status(),
                ))
            }
            other => other,
        }
    }

    /// Locate the query's reference time in the retained data.
    pub async fn match_time_relative(
        &self,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.update_registration().await;
        let state = self.door.read("ChunkSeries::match_time_relative").await;
        let expanded = with_all_channels(query, &state.registered);
        let query = expanded.as_ref().unwrap_or(query);

        let mut direction: Option<Ordering> = None;
        for name in &query.channels {
            let Some(d) = state.registered.extract(name).compare(query.reference) else {
                continue;
            };
            match direction {
                None => direction = Some(d),
                Some(previous) if previous != d => return Ok(TimeRelativeMatch::disagree()),
                Some(_) => {}
            }
        }
        match direction {
            None | Some(Ordering::Less) => return Ok(TimeRelativeMatch::before()),
            Some(Ordering::Greater) => return Ok(TimeRelativeMatch::after()),
            Some(Ordering::Equal) => {}
        }

        let ctx = self.context();
        let chunks = &state.chunks;
        let mut lo = 0isize;
        let mut hi = chunks.len() as isize - 1;
        let mut last_idx = 0usize;
        let mut last_good: Option<MatchStatus> = None;
        let mut result = TimeRelativeMatch::before();
        while lo <= hi {
            let idx = ((lo + hi) / 2) as usize;
            result = self.match_chunk(&chunks[idx], &ctx, query, None).await?;
            if !result.status.is_boundary() {
                last_good = Some(result.status);
            }
            last_idx = idx;
            match result.status.direction() {
                0 => break,
                d if d < 0 => hi = idx as isize - 1,
                _ => lo = idx as isize + 1,
            }
        }

        // Between two chunks: the answer is the edge of the neighbour in the query direction.
        let direction = result.status.direction();
        if (direction < 0 && last_idx > 0) || (direction > 0 && last_idx + 1 < chunks.len()) {
            let next = if direction > 0 { last_idx + 1 } else { last_idx };
            result = if query.relationship.looks_back() {
                self.edge_search(chunks[..next].iter().rev(), &ctx, query, true)
                    .await?
                    .unwrap_or_else(TimeRelativeMatch::before)
            } else {
                self.edge_search(chunks[next..].iter(), &ctx, query, false)
                    .await?
                    .unwrap_or_else(TimeRelativeMatch::after)
            };
        }

        if result.status.is_boundary() {
            result = match (last_good, result.status) {
                (Some(status), _) => TimeRelativeMatch::with_status(status),
                (None, MatchStatus::BoundaryBefore) => TimeRelativeMatch::before(),
                (None, _) => TimeRelativeMatch::after(),
            };
        }
        Ok(result)
    }

    /// First conclusive edge among `chunks`, skipping chunks without data for the query.
    async fn edge_search<'c>(
        &self,
        chunks: impl Iterator<Item = &'c Arc<Chunk>>,
        ctx: &ChunkContext<'_>,
        query: &TimeRelativeQuery,
        looking_back: bool,
    ) -> StorageResult<Option<TimeRelativeMatch>> {
        for chunk in chunks {
            let found = self.match_chunk(chunk, ctx, query, Some(looking_back)).await?;
            if !found.status.is_boundary() {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// End of the retained data for the query's channels.
    pub async fn before_time_relative(
        &self,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.update_registration().await;
        let state = self.door.read("ChunkSeries::before_time_relative").await;
        Ok(match state.limits_of(&query.channels) {
            Some(span) => TimeRelativeMatch::exact(span.end, true),
            None => TimeRelativeMatch::before(),
        })
    }

    /// Start of the retained data for the query's channels.
    pub async fn after_time_relative(
        &self,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.update_registration().await;
        let state = self.door.read("ChunkSeries::after_time_relative").await;
        Ok(match state.limits_of(&query.channels) {
            Some(span) => TimeRelativeMatch::exact(span.start, false),
            None => TimeRelativeMatch::before(),
        })
    }

    /// Hand the frames overlapping the extractor's window to it, chunk by chunk.
    pub async fn move_down_from(
        &self,
        extractor: &mut dyn Extractor,
        pending: &mut BTreeSet<String>,
    ) -> StorageResult<MatchReason> {
        self.update_registration().await;
        let state = self.door.read("ChunkSeries::move_down_from").await;
        let Some(span) = state.registered.trange() else {
            return Ok(MatchReason::NoIntersection);
        };
        match extractor.window().relation_to(&span) {
            Ordering::Less => return Ok(MatchReason::Before),
            Ordering::Greater => return Ok(MatchReason::After),
            Ordering::Equal => {}
        }

        let ctx = self.context();
        let mut reason = MatchReason::NoIntersection;
        for chunk in &state.chunks {
            match chunk.move_down_from(&ctx, extractor, pending).await {
                Ok(MatchReason::Equal) => reason = MatchReason::Equal,
                // Every later chunk is later still.
                Ok(MatchReason::Before) => break,
                Ok(_) => {}
                Err(e) if e.is_format() => {
                    tracing::error!(
                        "Chunk {} of {} is unreadable, skipping it: {}",
                        chunk.index(),
                        self.name,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reason)
    }

    /// Like [`move_down_from`](Self::move_down_from), limited to the open
    /// chunk: the part of the data no lower tier has received yet.
    pub(crate) async fn move_down_current(
        &self,
        extractor: &mut dyn Extractor,
        pending: &mut BTreeSet<String>,
    ) -> StorageResult<MatchReason> {
        let state = self.door.read("ChunkSeries::move_down_current").await;
        let Some(current) = &state.current else {
            return Ok(MatchReason::NoIntersection);
        };
        current.move_down_from(&self.context(), extractor, pending).await
    }

    /// Collect the samples inside `window`.
    pub async fn extract(&self, window: Window, mode: ResponseMode) -> StorageResult<DataExtractor> {
        let mut pending = window.channels.clone();
        let mut extractor = DataExtractor::new(window, mode);
        self.move_down_from(&mut extractor, &mut pending).await?;
        if !pending.is_empty() {
            tracing::debug!("No data in window for {:?} of {}", pending, self.name);
        }
        Ok(extractor)
    }

    /// Resolve a request's time reference into a concrete window over the
    /// retained data. `None` when the request selects nothing that exists.
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

        self.update_registration().await;
        let limits = {
            let state = self.door.read("ChunkSeries::resolve_request").await;
            state.limits_of(&request.channels)
        };
        Ok(limits.and_then(|limits| resolve_reference(request, limits)))
    }

    /// Chunks currently held, oldest first.
    pub async fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.door.read("ChunkSeries::chunks").await.chunks.clone()
    }

    /// Index of the oldest retained chunk (the next index when nothing is retained).
    pub async fn oldest_index(&self) -> u64 {
        self.door.read("ChunkSeries::oldest_index").await.oldest_index
    }

    /// Snapshot of the aggregate catalog.
    pub async fn catalog(&self) -> TimeRangeCatalog {
        self.update_registration().await;
        self.door.read("ChunkSeries::catalog").await.registered.clone()
    }

    pub async fn stats(&self) -> SeriesStats {
        self.update_registration().await;
        let state = self.door.read("ChunkSeries::stats").await;
        let mut skeleton_chunks = 0;
        let mut resident_frames = 0;
        for chunk in &state.chunks {
            if chunk.is_skeleton().await {
                skeleton_chunks += 1;
            }
            resident_frames += chunk.frame_count().await;
        }
        SeriesStats {
            name: self.name.clone(),
            chunk_count: state.chunks.len(),
            resident_chunks: state.chunks.len() - skeleton_chunks,
            skeleton_chunks,
            current_index: state.current.as_ref().map(|c| c.index()),
            next_index: state.next_index,
            oldest_index: state.oldest_index,
            resident_frames,
            channel_count: state.registered.channel_count(),
            span: state.registered.trange(),
        }
    }

    /// Stop the flush task and close the current chunk. Further frames are rejected.
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.stop.send_replace(true);
        let handle = self
            .flush_task
            .lock()
            .map_err(|_| StorageError::Lock("flush task slot poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Flush task of {} ended abnormally: {}", self.name, e);
            }
        }

        let mut state = self.door.write("ChunkSeries::shutdown").await;
        if state.shut_down {
            return Ok(());
        }
        self.close_locked(&mut state).await?;
        state.shut_down = true;
        tracing::info!("Shut down series {}", self.name);
        Ok(())
    }

    /// Shut down, release every chunk and delete the archive directory.
    pub async fn destroy(&self) -> StorageResult<()> {
        self.stop.send_replace(true);
        let mut state = self.door.write("ChunkSeries::destroy").await;
        state.shut_down = true;
        state.current = None;
        for chunk in state.chunks.drain(..) {
            chunk.clear(self.disk.as_deref()).await;
        }
        state.registered = TimeRangeCatalog::new();
        state.oldest_index = state.next_index;
        if let Some(disk) = &self.disk {
            disk.remove()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChunkSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSeries")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("disk", &self.disk)
            .field("door", &self.door)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Relationship, RelationalOperator};
    use crate::storage::chunk::ChunkPhase;
    use crate::storage::disk::{HEADER_FILE, INDEX_FILE};
    use crate::storage::types::{Samples, TimeRange};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;
    use tokio::time::timeout;

    /// `n` one-second samples of `channel` starting at `start`.
    fn frame(channel: &str, start: f64, n: usize) -> Frame {
        Frame::new(TimeRange::new(start, n as f64)).channel(
            channel,
            Samples::Float64((0..n).map(|i| start + i as f64).collect()),
        )
    }

    fn one_per_chunk(max_chunks: usize) -> RetentionPolicy {
        RetentionPolicy::Capacity {
            max_chunks,
            max_elements_per_chunk: 1,
            max_bytes_per_chunk: usize::MAX,
        }
    }

    async fn memory_series(policy: RetentionPolicy) -> Arc<ChunkSeries> {
        ChunkSeries::open(SeriesConfig::new("test").policy(policy).reframe(false))
            .await
            .unwrap()
    }

    fn query(reference: f64, relationship: Relationship) -> TimeRelativeQuery {
        TimeRelativeQuery::new(reference, relationship).channel("a")
    }

    #[tokio::test]
    async fn test_empty_series_is_before() {
        let series = memory_series(RetentionPolicy::default()).await;
        let m = series
            .match_time_relative(&query(5.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);
        assert_eq!(m.status.code(), -1);
    }

    #[tokio::test]
    async fn test_at_or_after_chunk_boundary() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 10)).await.unwrap();
        series.add_element(frame("a", 10.0, 10)).await.unwrap();
        assert_eq!(series.stats().await.chunk_count, 2);

        let m = series
            .match_time_relative(&query(10.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status.code(), m.time, m.invert), (0, 10.0, false));

        let m = series
            .match_time_relative(&query(10.0, Relationship::Before))
            .await
            .unwrap();
        assert_eq!((m.status.code(), m.time, m.invert), (0, 10.0, true));
    }

    #[tokio::test]
    async fn test_gap_between_chunks_resolved_from_edges() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        series.add_element(frame("a", 10.0, 10)).await.unwrap();

        let m = series
            .match_time_relative(&query(7.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status, m.time, m.invert), (MatchStatus::Exact, 10.0, false));

        let m = series
            .match_time_relative(&query(7.0, Relationship::AtOrBefore))
            .await
            .unwrap();
        assert_eq!((m.status, m.time, m.invert), (MatchStatus::Exact, 5.0, true));
    }

    #[tokio::test]
    async fn test_edge_skips_chunks_without_channel() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        series.add_element(frame("b", 5.0, 5)).await.unwrap();
        series.add_element(frame("a", 10.0, 5)).await.unwrap();

        // chunk 1 holds only "b"; the answer comes from chunk 0
        let m = series
            .match_time_relative(&query(7.0, Relationship::AtOrBefore))
            .await
            .unwrap();
        assert_eq!((m.status, m.time, m.invert), (MatchStatus::Exact, 5.0, true));

        let m = series
            .match_time_relative(&query(7.0, Relationship::After))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 10.0));
    }

    #[tokio::test]
    async fn test_outside_retained_range() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 10.0, 10)).await.unwrap();

        let m = series
            .match_time_relative(&query(5.0, Relationship::Before))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);

        let m = series
            .match_time_relative(&query(25.0, Relationship::After))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::After);

        let unknown = TimeRelativeQuery::new(12.0, Relationship::After).channel("zzz");
        assert_eq!(
            series.match_time_relative(&unknown).await.unwrap().status,
            MatchStatus::Before
        );
    }

    #[tokio::test]
    async fn test_channels_disagree() {
        let series = memory_series(RetentionPolicy::default()).await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        series.add_element(frame("b", 10.0, 5)).await.unwrap();

        let q = TimeRelativeQuery::new(7.0, Relationship::AtOrAfter).channels(["a", "b"]);
        let m = series.match_time_relative(&q).await.unwrap();
        assert_eq!(m.status, MatchStatus::Disagree);
        assert_eq!(m.status.code(), -2);

        // split per channel, each resolves on its own
        let parts: Vec<MatchStatus> = {
            let mut out = Vec::new();
            for part in q.split() {
                out.push(series.match_time_relative(&part).await.unwrap().status);
            }
            out
        };
        assert_eq!(parts, vec![MatchStatus::After, MatchStatus::Before]);
    }

    #[tokio::test]
    async fn test_backward_frame_rejected() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 10.0, 10)).await.unwrap();

        let err = series.add_element(frame("a", 0.0, 5)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidFrame(_)));
        // overlapping the previous frame is going back too
        assert!(series.add_element(frame("a", 15.0, 10)).await.is_err());

        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.next_index, 1);
        let m = series
            .match_time_relative(&query(3.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);
    }

    #[tokio::test]
    async fn test_start_within_rounding_of_previous_end_accepted() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 10)).await.unwrap();
        series
            .add_element(frame("a", 10.0 * (1.0 - 1e-15), 10))
            .await
            .unwrap();
        assert!(series.add_element(frame("a", 19.9, 1)).await.is_err());
        assert_eq!(series.stats().await.chunk_count, 2);
    }

    #[tokio::test]
    async fn test_chunks_ordered_by_time() {
        let series = memory_series(RetentionPolicy::Capacity {
            max_chunks: 10,
            max_elements_per_chunk: 2,
            max_bytes_per_chunk: usize::MAX,
        })
        .await;
        let mut start = 0.0;
        for (i, gap) in [0.0, 3.0, 0.0, 7.5, 1.0, 0.0, 12.0].into_iter().enumerate() {
            start += gap;
            series.add_element(frame("a", start, i + 1)).await.unwrap();
            start += (i + 1) as f64;
            assert!(series.add_element(frame("a", start - 0.5, 1)).await.is_err());
        }
        series.close_current().await.unwrap();

        let chunks = series.chunks().await;
        assert_eq!(chunks.len(), 4);
        let mut spans = Vec::new();
        for chunk in &chunks {
            spans.push(chunk.time_span().await.unwrap());
        }
        for pair in spans.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{:?} after {:?}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_query_without_channels_covers_all() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        series.add_element(frame("a", 5.0, 5)).await.unwrap();

        let any = TimeRelativeQuery::new(6.5, Relationship::AtOrAfter);
        assert!(any.channels.is_empty());
        let m = series.match_time_relative(&any).await.unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 7.0));

        let m = series
            .match_time_relative(&TimeRelativeQuery::new(20.0, Relationship::Before))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::After);
    }

    #[tokio::test]
    async fn test_capacity_trim_keeps_max_chunks() {
        let series = memory_series(one_per_chunk(2)).await;
        for i in 0..5 {
            series.add_element(frame("a", i as f64 * 10.0, 10)).await.unwrap();
            assert!(series.stats().await.chunk_count <= 2);
        }
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.next_index, 5);
        assert_eq!(series.oldest_index().await, 3);

        let m = series
            .match_time_relative(&query(5.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);
    }

    #[tokio::test]
    async fn test_zero_max_chunks_keeps_only_active() {
        let series = memory_series(RetentionPolicy::Capacity {
            max_chunks: 0,
            max_elements_per_chunk: 2,
            max_bytes_per_chunk: usize::MAX,
        })
        .await;
        for i in 0..4 {
            series.add_element(frame("a", i as f64, 1)).await.unwrap();
        }
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.oldest_index, 1);
        assert_eq!(stats.current_index, None);
    }

    #[tokio::test]
    async fn test_byte_budget_closes_chunk() {
        let series = memory_series(RetentionPolicy::Capacity {
            max_chunks: 10,
            max_elements_per_chunk: 1000,
            max_bytes_per_chunk: 1,
        })
        .await;
        series.add_element(frame("a", 0.0, 4)).await.unwrap();
        series.add_element(frame("a", 4.0, 4)).await.unwrap();
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.current_index, None);
    }

    #[tokio::test]
    async fn test_time_trim_drops_oldest_past_horizon() {
        let series = memory_series(RetentionPolicy::Time {
            flush_interval: Duration::from_secs(3600),
            trim_horizon: Duration::from_secs(15),
        })
        .await;
        // 20s of newer chunks is needed before anything goes
        for i in 0..3 {
            series.add_element(frame("a", i as f64 * 10.0, 10)).await.unwrap();
            series.close_current().await.unwrap();
        }
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.oldest_index, 0);

        series.add_element(frame("a", 30.0, 10)).await.unwrap();
        series.close_current().await.unwrap();
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.oldest_index, 1);
        series.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_time_trim_estimates_instant_chunks() {
        // Heuristic: a chunk of instants is charged one flush interval.
        let series = memory_series(RetentionPolicy::Time {
            flush_interval: Duration::from_secs(10),
            trim_horizon: Duration::from_secs(15),
        })
        .await;
        for i in 0..4 {
            let instant = Frame::new(TimeRange::instant(i as f64))
                .channel("a", Samples::Float64(vec![i as f64]));
            series.add_element(instant).await.unwrap();
            series.close_current().await.unwrap();
        }
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.oldest_index, 1);
        series.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_task_closes_current() {
        let series = memory_series(RetentionPolicy::Time {
            flush_interval: Duration::from_millis(20),
            trim_horizon: Duration::from_secs(3600),
        })
        .await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        assert_eq!(series.stats().await.current_index, Some(0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(series.stats().await.current_index, None);

        series.shutdown().await.unwrap();
        assert!(series.flush_task.lock().unwrap().is_none());
        assert!(series.add_element(frame("a", 5.0, 5)).await.is_err());
    }

    #[tokio::test]
    async fn test_update_registration_codes() {
        let series = memory_series(RetentionPolicy::default()).await;
        assert_eq!(series.update_registration().await, 0);
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        assert_eq!(series.update_registration().await, 1);
        assert_eq!(series.update_registration().await, 0);

        let trimmed = memory_series(one_per_chunk(1)).await;
        for i in 0..3 {
            trimmed.add_element(frame("a", i as f64 * 5.0, 5)).await.unwrap();
        }
        assert_eq!(trimmed.update_registration().await, -1);
        assert_eq!(trimmed.update_registration().await, 0);
        assert_eq!(trimmed.catalog().await.extract("a").start_time, 10.0);
    }

    #[tokio::test]
    async fn test_reframed_chunk_swapped_in() {
        let series = ChunkSeries::open(SeriesConfig::new("test").policy(RetentionPolicy::Capacity {
            max_chunks: 10,
            max_elements_per_chunk: 3,
            max_bytes_per_chunk: usize::MAX,
        }))
        .await
        .unwrap();
        for i in 0..3 {
            series.add_element(frame("a", i as f64, 1)).await.unwrap();
        }
        let chunks = series.chunks().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_reframed().await);
        assert_eq!(chunks[0].frame_count().await, 1);
        assert_eq!(chunks[0].phase().await, ChunkPhase::Closed);

        let m = series
            .match_time_relative(&query(1.5, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 2.0));
    }

    #[tokio::test]
    async fn test_independent_series_do_not_block() {
        let a = memory_series(RetentionPolicy::default()).await;
        let b = memory_series(RetentionPolicy::default()).await;

        let _held = a.door.write("test").await;
        timeout(Duration::from_secs(1), b.add_element(frame("a", 0.0, 5)))
            .await
            .expect("series b must not wait for series a")
            .unwrap();
    }

    #[tokio::test]
    async fn test_same_series_add_and_match_serialize() {
        let series = memory_series(RetentionPolicy::default()).await;
        series.add_element(frame("a", 0.0, 5)).await.unwrap();

        let held = series.door.write("test").await;
        let matcher = {
            let series = Arc::clone(&series);
            tokio::spawn(async move {
                series
                    .match_time_relative(&query(2.0, Relationship::AtOrAfter))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!matcher.is_finished());
        assert_eq!(series.door.writer(), Some("test"));

        drop(held);
        let m = timeout(Duration::from_secs(1), matcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 2.0));
    }

    #[tokio::test]
    async fn test_persisting_series_recovers() {
        let dir = tempdir().unwrap();
        let config = SeriesConfig::new("durable")
            .policy(one_per_chunk(10))
            .archive(dir.path())
            .reframe(false);
        {
            let series = ChunkSeries::open(config.clone()).await.unwrap();
            for i in 0..3 {
                series.add_element(frame("a", i as f64 * 10.0, 10)).await.unwrap();
            }
            let stats = series.stats().await;
            assert_eq!(stats.skeleton_chunks, 3);
            assert_eq!(stats.resident_frames, 0);
            series.shutdown().await.unwrap();
        }

        let series = ChunkSeries::open(config).await.unwrap();
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.skeleton_chunks, 3);
        assert_eq!(stats.next_index, 3);

        let m = series
            .match_time_relative(&query(12.5, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 13.0));

        let data = series
            .extract(Window::new(11.0, 2.0).channel("a"), ResponseMode::Consolidated)
            .await
            .unwrap();
        assert_eq!(data.column("a").unwrap().times, vec![11.0, 12.0]);

        series.add_element(frame("a", 30.0, 10)).await.unwrap();
        assert_eq!(series.stats().await.next_index, 4);
    }

    #[tokio::test]
    async fn test_recovery_skips_damaged_records() {
        let dir = tempdir().unwrap();
        let config = SeriesConfig::new("durable")
            .policy(one_per_chunk(10))
            .archive(dir.path())
            .reframe(false);
        {
            let series = ChunkSeries::open(config.clone()).await.unwrap();
            for i in 0..3 {
                series.add_element(frame("a", i as f64 * 10.0, 10)).await.unwrap();
            }
        }

        // torn index append and a clobbered first header marker
        let mut index = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(INDEX_FILE))
            .unwrap();
        index.write_all(&[1, 0, 0]).unwrap();
        let mut header = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(HEADER_FILE))
            .unwrap();
        header.seek(SeekFrom::Start(0)).unwrap();
        header.write_all(b"XXX").unwrap();

        let series = ChunkSeries::open(config).await.unwrap();
        let stats = series.stats().await;
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.oldest_index, 1);
        assert_eq!(stats.next_index, 3);

        let m = series
            .match_time_relative(&query(5.0, Relationship::AtOrAfter))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Before);
    }

    #[tokio::test]
    async fn test_resolve_request_references() {
        let series = memory_series(one_per_chunk(10)).await;
        series.add_element(frame("a", 0.0, 10)).await.unwrap();
        series.add_element(frame("a", 10.0, 10)).await.unwrap();

        let newest = series
            .resolve_request(&RequestDescriptor::newest(2.0).channel("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((newest.start, newest.duration), (18.0, 2.0));
        let data = series
            .extract(newest, ResponseMode::Consolidated)
            .await
            .unwrap();
        assert_eq!(data.column("a").unwrap().times, vec![18.0, 19.0]);

        let oldest = series
            .resolve_request(&RequestDescriptor::oldest(5.0).channel("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(oldest.start, 0.0);

        let absolute = RequestDescriptor::new(12.5, 3.0)
            .channel("a")
            .relationship(RelationalOperator::GreaterEqual);
        let window = series.resolve_request(&absolute).await.unwrap().unwrap();
        assert_eq!((window.start, window.duration), (13.0, 3.0));

        let aligned = RequestDescriptor::new(0.0, 3.0)
            .channel("a")
            .reference(ReferenceMode::Aligned);
        let window = series.resolve_request(&aligned).await.unwrap().unwrap();
        assert_eq!(window.start, 15.0);

        let after = RequestDescriptor::new(19.5, 5.0)
            .channel("a")
            .reference(ReferenceMode::After);
        let window = series.resolve_request(&after).await.unwrap().unwrap();
        assert_eq!((window.start, window.duration), (19.5, 0.5));

        let future = RequestDescriptor::newest(1.0).domain(crate::query::Domain::Future);
        assert!(series.resolve_request(&future).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_removes_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("series");
        let series = ChunkSeries::open(
            SeriesConfig::new("doomed")
                .policy(one_per_chunk(10))
                .archive(&archive),
        )
        .await
        .unwrap();
        series.add_element(frame("a", 0.0, 5)).await.unwrap();
        assert!(archive.join(INDEX_FILE).exists());

        series.destroy().await.unwrap();
        assert!(!archive.exists());
        assert_eq!(series.stats().await.chunk_count, 0);
    }
}
