//! Chunks: the atomic storage unit of a series
//!
//! A chunk holds the frames of one stretch of time together with a per-channel
//! catalog of what those frames cover and a coarse summary of that catalog.
//!
//! Lifecycle:
//!
//! ```text
//! EMPTY → ACCUMULATING → (reframed | uncompacted) → CLOSED → SKELETON ⇄ LOADED → discarded
//! ```
//!
//! Once flushed to a [`DiskChunkGroup`] the chunk can drop its frames and keep
//! only the summary (a skeleton). Anything that needs the frames again reads
//! them back through the group's single-slot cache; the skeleton itself stays
//! untouched, so loading is always safe to repeat.

use crate::query::{
    ChannelColumn, Extractor, MatchReason, Relationship, TimeRelativeMatch, TimeRelativeQuery,
};
use crate::storage::catalog::TimeRangeCatalog;
use crate::storage::disk::{DiskChunkGroup, DiskOffsets, LoadMode, LoadedChunk};
use crate::storage::door::{Door, DoorHeld};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Frame, FrameRange, Span, TimeRange};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

static REGISTRATION_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Monotonic stamp marking when a catalog last changed.
pub(crate) fn registration_stamp() -> u64 {
    REGISTRATION_CLOCK.fetch_add(1, AtomicOrdering::SeqCst)
}

/// Where a chunk's content lives besides memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Memory,
    OnDisk(DiskOffsets),
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    Empty,
    Accumulating,
    Closed,
    Skeleton,
    Discarded,
}

/// What a chunk operation may need from its surroundings.
#[derive(Debug, Clone, Copy)]
pub struct ChunkContext<'a> {
    pub series: &'a str,
    pub disk: Option<&'a DiskChunkGroup>,
}

impl<'a> ChunkContext<'a> {
    pub fn new(series: &'a str, disk: Option<&'a DiskChunkGroup>) -> Self {
        Self { series, disk }
    }
}

#[derive(Debug, thiserror::Error)]
enum ReframeError {
    #[error("chunk has no frames")]
    Empty,
    #[error("channel {0} mixes sample types")]
    TypeMismatch(String),
    #[error("channel {0} mixes sample durations")]
    MixedDurations(String),
    #[error("channel {0} has overlapping frames")]
    Unordered(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] StorageError),
}

#[derive(Debug, Default)]
pub(crate) struct ChunkState {
    frames: Vec<Frame>,
    frame_range: Option<FrameRange>,
    registered: Option<TimeRangeCatalog>,
    summary: Option<TimeRangeCatalog>,
    /// Frames before this position are already in `registered`
    registered_upto: usize,
    up_to_date: bool,
    last_registration: u64,
    location: Location,
    data_size: usize,
    closed: bool,
    reframed: bool,
    discarded: bool,
}

impl ChunkState {
    /// Merge frames not yet seen into the chunk catalog.
    fn build_registration(&mut self) -> bool {
        let catalog = self.registered.get_or_insert_with(TimeRangeCatalog::new);
        let mut changed = false;
        for frame in &self.frames[self.registered_upto.min(self.frames.len())..] {
            changed |= catalog.update_registration(frame, false, false);
        }
        self.registered_upto = self.frames.len();
        changed
    }

    fn refresh(&mut self) -> bool {
        if self.up_to_date {
            return false;
        }
        let changed = self.build_registration();
        if changed || self.summary.is_none() {
            self.summary = self.registered.as_ref().map(TimeRangeCatalog::summarize);
        }
        if changed {
            self.last_registration = registration_stamp();
        }
        self.up_to_date = true;
        changed
    }

    fn insertion_point(&self, frame: &Frame) -> usize {
        let start = frame.time.start();
        match self.frames.last() {
            Some(last) if last.time.start() > start => self
                .frames
                .partition_point(|f| f.time.start() <= start),
            _ => self.frames.len(),
        }
    }

    /// Index of a frame with the same time range and no shared channel.
    fn merge_target(&self, frame: &Frame) -> Option<usize> {
        let start = frame.time.start();
        self.frames
            .iter()
            .enumerate()
            .rev()
            .take_while(|(_, f)| f.time.start() >= start)
            .find(|(_, f)| {
                f.time == frame.time && !frame.channels.keys().any(|n| f.channels.contains_key(n))
            })
            .map(|(i, _)| i)
    }

    fn is_skeleton(&self) -> bool {
        self.frames.is_empty() && matches!(self.location, Location::OnDisk(_))
    }

    fn phase(&self) -> ChunkPhase {
        if self.discarded {
            ChunkPhase::Discarded
        } else if self.is_skeleton() {
            ChunkPhase::Skeleton
        } else if self.closed {
            ChunkPhase::Closed
        } else if self.frames.is_empty() {
            ChunkPhase::Empty
        } else {
            ChunkPhase::Accumulating
        }
    }

    /// Per-channel columns in time order.
    fn columns(&self, frames: &[Frame]) -> Result<BTreeMap<String, ChannelColumn>, ReframeError> {
        let mut columns: BTreeMap<String, ChannelColumn> = BTreeMap::new();
        for frame in frames {
            for (name, samples) in &frame.channels {
                let column = columns
                    .entry(name.clone())
                    .or_insert_with(|| ChannelColumn::empty(samples.kind()));
                if column.samples.kind() != samples.kind() {
                    return Err(ReframeError::TypeMismatch(name.clone()));
                }
                column.push_frame(&frame.time, samples)?;
            }
        }
        Ok(columns)
    }

    /// Columnar rewrite of the frames: one frame per channel with explicit point times.
    fn reframed_frames(&self) -> Result<Vec<Frame>, ReframeError> {
        if self.frames.is_empty() {
            return Err(ReframeError::Empty);
        }
        let inclusive_ends: BTreeMap<&str, bool> = self
            .frames
            .iter()
            .flat_map(|f| {
                let span = f.time.span();
                f.channels.keys().map(move |n| (n.as_str(), span))
            })
            .fold(BTreeMap::new(), |mut acc: BTreeMap<&str, Span>, (name, span)| {
                acc.entry(name)
                    .and_modify(|s| *s = s.union(&span))
                    .or_insert(span);
                acc
            })
            .into_iter()
            .map(|(name, span)| (name, span.inclusive && span.duration() > 0.0))
            .collect();

        let mut frames = Vec::new();
        for (name, column) in self.columns(&self.frames)? {
            let duration = column.durations[0];
            if column.durations.iter().any(|d| *d != duration) {
                return Err(ReframeError::MixedDurations(name));
            }
            if column.times.windows(2).any(|w| w[1] < w[0]) {
                return Err(ReframeError::Unordered(name));
            }
            let inclusive = inclusive_ends.get(name.as_str()).copied().unwrap_or(false);
            let time = TimeRange::points(column.times, duration)?.inclusive(inclusive);
            let mut frame = Frame::new(time).channel(name, column.samples);
            frame.frames = self.frame_range;
            frames.push(frame);
        }
        frames.sort_by(|a, b| {
            a.time
                .start()
                .partial_cmp(&b.time.start())
                .unwrap_or(Ordering::Equal)
        });
        Ok(frames)
    }
}

/// An ordered, time-bounded unit of stored frames
pub struct Chunk {
    index: u64,
    door: Door<ChunkState>,
}

impl Chunk {
    pub fn new(index: u64) -> Self {
        Self::with_state(index, ChunkState::default())
    }

    fn with_state(index: u64, state: ChunkState) -> Self {
        Self {
            index,
            door: Door::new(format!("chunk:{}", index), state),
        }
    }

    /// A closed skeleton pointing at content already on disk.
    pub fn skeleton(index: u64, offsets: DiskOffsets) -> Self {
        Self::with_state(
            index,
            ChunkState {
                location: Location::OnDisk(offsets),
                closed: true,
                up_to_date: true,
                ..ChunkState::default()
            },
        )
    }

    /// Skeleton rebuilt from a skeleton-only read during recovery.
    pub(crate) fn recovered(index: u64, offsets: DiskOffsets, loaded: &LoadedChunk) -> Self {
        Self::with_state(
            index,
            ChunkState {
                frame_range: loaded.frame_range,
                summary: Some(loaded.catalog.summarize()),
                last_registration: registration_stamp(),
                location: Location::OnDisk(offsets),
                closed: true,
                up_to_date: true,
                ..ChunkState::default()
            },
        )
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub async fn phase(&self) -> ChunkPhase {
        self.door.read("Chunk::phase").await.phase()
    }

    pub async fn is_skeleton(&self) -> bool {
        self.door.read("Chunk::is_skeleton").await.is_skeleton()
    }

    pub async fn is_reframed(&self) -> bool {
        self.door.read("Chunk::is_reframed").await.reframed
    }

    pub async fn location(&self) -> Location {
        self.door.read("Chunk::location").await.location
    }

    /// Number of resident top-level frames.
    pub async fn frame_count(&self) -> usize {
        self.door.read("Chunk::frame_count").await.frames.len()
    }

    /// Approximate resident payload in bytes.
    pub async fn data_size(&self) -> usize {
        self.door.read("Chunk::data_size").await.data_size
    }

    pub async fn frame_range(&self) -> Option<FrameRange> {
        self.door.read("Chunk::frame_range").await.frame_range
    }

    pub async fn summary(&self) -> Option<TimeRangeCatalog> {
        self.door.read("Chunk::summary").await.summary.clone()
    }

    /// Time covered by every channel of the chunk.
    pub async fn time_span(&self) -> Option<Span> {
        self.door
            .read("Chunk::time_span")
            .await
            .summary
            .as_ref()
            .and_then(TimeRangeCatalog::trange)
    }

    pub async fn resident_frames(&self) -> Vec<Frame> {
        self.door.read("Chunk::resident_frames").await.frames.clone()
    }

    pub(crate) async fn last_registration(&self) -> u64 {
        self.door.read("Chunk::last_registration").await.last_registration
    }

    /// Add a frame. Single flat channels are spliced in directly; other frames
    /// merge into an existing frame over the same time when channels don't collide.
    /// The catalog is not touched here.
    pub async fn store_element(&self, frame: Frame) -> StorageResult<()> {
        frame.validate()?;
        let mut state = self.door.write("Chunk::store_element").await;
        if state.closed {
            return Err(StorageError::InvalidState(format!(
                "chunk {} is closed",
                self.index
            )));
        }

        state.data_size += frame.estimated_size();
        if let Some(range) = frame.frames {
            state.frame_range = Some(match state.frame_range {
                Some(existing) => existing.union(&range),
                None => range,
            });
        }

        let target = if frame.is_single_channel() {
            None
        } else {
            state.merge_target(&frame)
        };
        let touched = match target {
            Some(pos) => {
                state.frames[pos].absorb(frame)?;
                pos
            }
            None => {
                let pos = state.insertion_point(&frame);
                state.frames.insert(pos, frame);
                pos
            }
        };
        state.registered_upto = state.registered_upto.min(touched);
        state.up_to_date = false;
        Ok(())
    }

    /// Merge frames stored since the last call into the chunk catalog.
    /// Returns whether the catalog changed.
    pub async fn build_registration(&self) -> bool {
        let mut state = self.door.write("Chunk::build_registration").await;
        let changed = state.build_registration();
        if changed {
            state.summary = state.registered.as_ref().map(TimeRangeCatalog::summarize);
            state.last_registration = registration_stamp();
        }
        changed
    }

    /// Bring catalog and summary up to date. Returns whether anything changed.
    pub async fn update_registration(&self) -> bool {
        let mut state = self.door.write("Chunk::update_registration").await;
        state.refresh()
    }

    /// Close to further frames.
    pub async fn close(&self) {
        let mut state = self.door.write("Chunk::close").await;
        state.refresh();
        state.closed = true;
    }

    /// Compacted copy with one columnar frame per channel, or `None` if the
    /// frames cannot be compacted without loss. The original is never modified.
    pub async fn reframe(&self) -> Option<Chunk> {
        let state = self.door.read("Chunk::reframe").await;
        match state.reframed_frames() {
            Ok(frames) => {
                let data_size = frames.iter().map(Frame::estimated_size).sum();
                tracing::debug!(
                    "Reframed chunk {}: {} frames into {}",
                    self.index,
                    state.frames.len(),
                    frames.len()
                );
                Some(Chunk::with_state(
                    self.index,
                    ChunkState {
                        frames,
                        frame_range: state.frame_range,
                        data_size,
                        reframed: true,
                        ..ChunkState::default()
                    },
                ))
            }
            Err(e) => {
                tracing::debug!("Reframe of chunk {} abandoned: {}", self.index, e);
                None
            }
        }
    }

    /// Append this chunk to `disk` and remember where it went. Closes the chunk.
    pub async fn flush_to_disk(&self, disk: &DiskChunkGroup) -> StorageResult<DiskOffsets> {
        let mut state = self.door.write("Chunk::flush_to_disk").await;
        if let Location::OnDisk(offsets) = state.location {
            return Ok(offsets);
        }
        state.refresh();
        let catalog = state.registered.clone().unwrap_or_default();
        let offsets = disk.write_chunk(
            &state,
            self.index,
            &state.frames,
            state.frame_range,
            &catalog,
        )?;
        state.location = Location::OnDisk(offsets);
        state.closed = true;
        tracing::debug!(
            "Flushed chunk {} ({} frames) at data offset {}",
            self.index,
            state.frames.len(),
            offsets.data
        );
        Ok(offsets)
    }

    /// Read this chunk's content back from `disk`.
    pub async fn load_from_archive(
        &self,
        disk: &DiskChunkGroup,
        mode: LoadMode,
    ) -> StorageResult<Arc<LoadedChunk>> {
        let state = self.door.read("Chunk::load_from_archive").await;
        self.load_locked(&state, &state, disk, mode)
    }

    fn load_locked(
        &self,
        held: &dyn DoorHeld,
        state: &ChunkState,
        disk: &DiskChunkGroup,
        mode: LoadMode,
    ) -> StorageResult<Arc<LoadedChunk>> {
        if mode == LoadMode::Full {
            if let Some(cached) = disk.cached(self.index) {
                tracing::trace!("Chunk {} served from cache", self.index);
                return Ok(cached);
            }
        }
        let offsets = match state.location {
            Location::OnDisk(offsets) => offsets,
            Location::Memory => {
                return Err(StorageError::InvalidState(format!(
                    "chunk {} has never been flushed",
                    self.index
                )))
            }
        };
        let loaded = Arc::new(disk.read_chunk(held, self.index, offsets, mode)?);
        if mode == LoadMode::Full {
            disk.remember(Arc::clone(&loaded));
        }
        Ok(loaded)
    }

    /// Drop the frames of a flushed chunk, keeping only its summary.
    ///
    /// The chunk catalog is merged into `parent` first, so the series never loses
    /// track of what the skeleton covers. Returns false when the chunk cannot be
    /// reduced (never flushed) or already is a skeleton.
    pub async fn reduce_to_skeleton(&self, parent: &mut TimeRangeCatalog) -> bool {
        let mut state = self.door.write("Chunk::reduce_to_skeleton").await;
        if !matches!(state.location, Location::OnDisk(_)) || state.is_skeleton() {
            return false;
        }
        state.refresh();
        if let Some(catalog) = state.registered.as_ref() {
            parent.update_registration(catalog, false, false);
        }
        state.frames = Vec::new();
        state.registered = None;
        state.registered_upto = 0;
        state.up_to_date = true;
        true
    }

    /// Release everything; the chunk is being dropped from its series.
    pub async fn clear(&self, disk: Option<&DiskChunkGroup>) {
        let mut state = self.door.write("Chunk::clear").await;
        *state = ChunkState {
            discarded: true,
            closed: true,
            up_to_date: true,
            ..ChunkState::default()
        };
        if let Some(disk) = disk {
            disk.invalidate(self.index);
        }
    }

    /// Frames to search: resident ones, or the disk copy of a skeleton.
    fn frames_for<'s>(
        &self,
        held: &dyn DoorHeld,
        state: &'s ChunkState,
        ctx: &ChunkContext<'_>,
        loaded: &'s mut Option<Arc<LoadedChunk>>,
    ) -> StorageResult<&'s [Frame]> {
        if !state.is_skeleton() {
            return Ok(&state.frames);
        }
        let disk = ctx.disk.ok_or_else(|| {
            StorageError::InvalidState(format!(
                "skeleton chunk {} of {} has no disk group",
                self.index, ctx.series
            ))
        })?;
        let chunk = self.load_locked(held, state, disk, LoadMode::Full)?;
        Ok(&loaded.insert(chunk).frames)
    }

    /// Locate the query's reference time inside this chunk.
    ///
    /// Returns -1/1 when the reference lies before/after this chunk's data for the
    /// requested channels, and the ±3 sentinel when the chunk holds none of them.
    pub async fn match_time_relative(
        &self,
        ctx: &ChunkContext<'_>,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.update_registration().await;
        let state = self.door.read("Chunk::match_time_relative").await;

        let summary = match state.summary.as_ref() {
            Some(summary) if !summary.is_empty() => summary,
            _ => return Ok(TimeRelativeMatch::with_status(query.relationship.boundary_status())),
        };

        let directions: Vec<(&str, Ordering)> = query
            .channels
            .iter()
            .filter_map(|name| {
                summary
                    .extract(name)
                    .compare(query.reference)
                    .map(|d| (name.as_str(), d))
            })
            .collect();
        if directions.is_empty() {
            return Ok(TimeRelativeMatch::with_status(
                missing_channel_status(summary.trange(), query),
            ));
        }

        let mut loaded = None;
        let frames: &[Frame] = if directions.iter().any(|(_, d)| *d == Ordering::Equal) {
            self.frames_for(&state, &state, ctx, &mut loaded)?
        } else {
            &[]
        };

        let results: Vec<TimeRelativeMatch> = directions
            .iter()
            .map(|(name, direction)| match direction {
                Ordering::Less => TimeRelativeMatch::before(),
                Ordering::Greater => TimeRelativeMatch::after(),
                Ordering::Equal => match_channel(frames, name, query),
            })
            .collect();
        Ok(TimeRelativeMatch::combine(&results, query.relationship)
            .unwrap_or_else(|| TimeRelativeMatch::with_status(query.relationship.boundary_status())))
    }

    /// End of this chunk's data for the requested channels (`invert = true`).
    /// Answered from the summary, which stays exact for skeletons.
    pub async fn before_time_relative(
        &self,
        _ctx: &ChunkContext<'_>,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.edge_time_relative(query, Relationship::Before).await
    }

    /// Start of this chunk's data for the requested channels.
    pub async fn after_time_relative(
        &self,
        _ctx: &ChunkContext<'_>,
        query: &TimeRelativeQuery,
    ) -> StorageResult<TimeRelativeMatch> {
        self.edge_time_relative(query, Relationship::After).await
    }

    async fn edge_time_relative(
        &self,
        query: &TimeRelativeQuery,
        side: Relationship,
    ) -> StorageResult<TimeRelativeMatch> {
        self.update_registration().await;
        let state = self.door.read("Chunk::edge_time_relative").await;
        let results: Vec<TimeRelativeMatch> = match state.summary.as_ref() {
            Some(summary) => query
                .channels
                .iter()
                .map(|name| summary.extract(name))
                .filter(|limits| !limits.is_empty())
                .map(|limits| {
                    if side.looks_back() {
                        TimeRelativeMatch::exact(limits.end_time(), true)
                    } else {
                        TimeRelativeMatch::exact(limits.start_time, false)
                    }
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(TimeRelativeMatch::combine(&results, side)
            .unwrap_or_else(|| TimeRelativeMatch::with_status(side.boundary_status())))
    }

    /// Hand frames overlapping the extractor's window to the extractor,
    /// reading a skeleton's frames back from disk first.
    pub async fn move_down_from(
        &self,
        ctx: &ChunkContext<'_>,
        extractor: &mut dyn Extractor,
        pending: &mut BTreeSet<String>,
    ) -> StorageResult<MatchReason> {
        self.update_registration().await;
        let state = self.door.read("Chunk::move_down_from").await;
        let span = match state.summary.as_ref().and_then(TimeRangeCatalog::trange) {
            Some(span) => span,
            None => return Ok(MatchReason::NoIntersection),
        };
        match extractor.window().relation_to(&span) {
            Ordering::Less => return Ok(MatchReason::Before),
            Ordering::Greater => return Ok(MatchReason::After),
            Ordering::Equal => {}
        }

        let mut loaded = None;
        let frames = self.frames_for(&state, &state, ctx, &mut loaded)?;
        let mut took = false;
        for frame in frames {
            if extractor.window().overlaps(&frame.time.span()) {
                took |= extractor.accept(self.index, frame, pending);
            }
        }
        Ok(if took {
            MatchReason::Equal
        } else {
            MatchReason::NoIntersection
        })
    }

    /// All samples of one channel in time order, or `None` if the chunk lacks it.
    pub async fn extract_channel(
        &self,
        ctx: &ChunkContext<'_>,
        name: &str,
    ) -> StorageResult<Option<ChannelColumn>> {
        let state = self.door.read("Chunk::extract_channel").await;
        let mut loaded = None;
        let frames = self.frames_for(&state, &state, ctx, &mut loaded)?;
        let mut column: Option<ChannelColumn> = None;
        for frame in frames {
            if let Some(samples) = frame.channels.get(name) {
                column
                    .get_or_insert_with(|| ChannelColumn::empty(samples.kind()))
                    .push_frame(&frame.time, samples)?;
            }
        }
        Ok(column)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("door", &self.door)
            .finish()
    }
}

/// Sentinel for a chunk without data for any requested channel, pointing the
/// search toward where the chunk sits relative to the reference.
fn missing_channel_status(
    span: Option<Span>,
    query: &TimeRelativeQuery,
) -> crate::query::MatchStatus {
    use crate::query::MatchStatus;
    match span.map(|s| s.compare(query.reference)) {
        Some(Ordering::Less) => MatchStatus::BoundaryBefore,
        Some(Ordering::Greater) => MatchStatus::BoundaryAfter,
        _ => query.relationship.boundary_status(),
    }
}

/// Binary search over the frames carrying `channel`.
fn match_channel(frames: &[Frame], channel: &str, query: &TimeRelativeQuery) -> TimeRelativeMatch {
    let candidates: Vec<(&TimeRange, usize)> = frames
        .iter()
        .filter_map(|f| f.channels.get(channel).map(|s| (&f.time, s.len())))
        .collect();
    if candidates.is_empty() {
        return TimeRelativeMatch::with_status(query.relationship.boundary_status());
    }

    let mut low = 0usize;
    let mut high = candidates.len();
    let mut idx = 0usize;
    let mut result = TimeRelativeMatch::before();
    while low < high {
        idx = low + (high - low) / 2;
        let (time, n) = candidates[idx];
        result = match time.span().compare(query.reference) {
            Ordering::Less => TimeRelativeMatch::before(),
            Ordering::Greater => TimeRelativeMatch::after(),
            Ordering::Equal => time.match_time_relative(query.relationship, query.reference, n),
        };
        match result.status.direction() {
            0 => return result,
            d if d < 0 => high = idx,
            _ => low = idx + 1,
        }
    }

    // Between two frames: the answer is the edge of the neighbour in the query direction.
    let direction = result.status.direction();
    if (direction < 0 && idx > 0) || (direction > 0 && idx + 1 < candidates.len()) {
        let idx = if direction > 0 { idx + 1 } else { idx };
        return if query.relationship.looks_back() {
            TimeRelativeMatch::exact(candidates[idx - 1].0.end(), true)
        } else {
            TimeRelativeMatch::exact(candidates[idx].0.start(), false)
        };
    }
    result
}
