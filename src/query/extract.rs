//! Pulling concrete samples out of matched chunks
//!
//! A [`Window`] names the time interval and channels a consumer wants. Chunks
//! hand every frame overlapping the window to an [`Extractor`], which keeps the
//! samples whose start times fall inside it.

use crate::query::request::ResponseMode;
use crate::storage::error::StorageResult;
use crate::storage::types::{Frame, SampleKind, Samples, Span, TimeRange};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Time interval `[start, start + duration)` over a set of channels.
///
/// An empty channel set selects every channel. A zero-length window selects
/// samples starting exactly at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: f64,
    pub duration: f64,
    pub channels: BTreeSet<String>,
    /// Data is wanted newest first
    pub reversed: bool,
}

impl Window {
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            start,
            duration: duration.max(0.0),
            channels: BTreeSet::new(),
            reversed: false,
        }
    }

    /// Builder method: add a channel
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channels.insert(name.into());
        self
    }

    /// Builder method: add several channels
    pub fn channels<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(names.into_iter().map(Into::into));
        self
    }

    /// Builder method: set the direction
    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Same window moved by `offset` seconds.
    pub fn shifted(&self, offset: f64) -> Window {
        Window {
            start: self.start + offset,
            ..self.clone()
        }
    }

    pub fn wants(&self, channel: &str) -> bool {
        self.channels.is_empty() || self.channels.contains(channel)
    }

    /// Whether a sample starting at `time` belongs to the window.
    pub fn contains(&self, time: f64) -> bool {
        if self.duration == 0.0 {
            time == self.start
        } else {
            time >= self.start && time < self.end()
        }
    }

    /// `Less` when the window ends before `span` begins, `Greater` when it
    /// starts after `span` ends, `Equal` when they overlap.
    pub fn relation_to(&self, span: &Span) -> Ordering {
        let ends_before = if self.duration == 0.0 {
            self.start < span.start
        } else {
            self.end() <= span.start
        };
        if ends_before {
            return Ordering::Less;
        }
        match span.compare(self.start) {
            Ordering::Greater => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }

    pub fn overlaps(&self, span: &Span) -> bool {
        self.relation_to(span) == Ordering::Equal
    }
}

/// Samples of one channel with their start times and durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelColumn {
    pub times: Vec<f64>,
    pub durations: Vec<f64>,
    pub samples: Samples,
}

impl ChannelColumn {
    pub fn empty(kind: SampleKind) -> Self {
        Self {
            times: Vec::new(),
            durations: Vec::new(),
            samples: Samples::empty(kind),
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Append every sample of a frame's column.
    pub fn push_frame(&mut self, time: &TimeRange, samples: &Samples) -> StorageResult<()> {
        let n = samples.len();
        self.samples.extend_from(samples)?;
        self.times.extend(time.point_times(n));
        self.durations
            .extend(std::iter::repeat(time.point_duration(n)).take(n));
        Ok(())
    }

    /// Append the samples of a frame's column that start inside `window`.
    /// Returns how many were taken.
    pub fn push_within(
        &mut self,
        time: &TimeRange,
        samples: &Samples,
        window: &Window,
    ) -> StorageResult<usize> {
        let n = samples.len();
        let times = time.point_times(n);
        let picked: Vec<usize> = (0..n).filter(|&i| window.contains(times[i])).collect();
        if picked.is_empty() {
            return Ok(0);
        }
        self.samples.extend_from(&samples.select(&picked))?;
        self.times.extend(picked.iter().map(|&i| times[i]));
        self.durations
            .extend(std::iter::repeat(time.point_duration(n)).take(picked.len()));
        Ok(picked.len())
    }
}

/// How a chunk related to an extraction window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// The window lies before the chunk
    Before,
    /// The window lies after the chunk
    After,
    /// Data was handed to the extractor
    Equal,
    /// The window overlaps the chunk but none of its samples were wanted
    NoIntersection,
}

/// Receives frames from the chunks a window overlaps.
pub trait Extractor: Send {
    fn window(&self) -> &Window;

    /// Take what the window wants from `frame` of chunk `chunk`, removing the
    /// channels that received data from `pending`. Returns whether anything was taken.
    fn accept(&mut self, chunk: u64, frame: &Frame, pending: &mut BTreeSet<String>) -> bool;
}

/// Samples of one channel from one source frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePiece {
    pub chunk: u64,
    pub channel: String,
    pub column: ChannelColumn,
}

/// Result of an extraction, shaped by the response mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractedData {
    Consolidated(BTreeMap<String, ChannelColumn>),
    Frames(Vec<FramePiece>),
}

/// Collects window contents in CONSOLIDATED or FRAMES mode.
#[derive(Debug)]
pub struct DataExtractor {
    window: Window,
    mode: ResponseMode,
    columns: BTreeMap<String, ChannelColumn>,
    pieces: Vec<FramePiece>,
    skipped: BTreeSet<String>,
}

impl DataExtractor {
    pub fn new(window: Window, mode: ResponseMode) -> Self {
        Self {
            window,
            mode,
            columns: BTreeMap::new(),
            pieces: Vec::new(),
            skipped: BTreeSet::new(),
        }
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Consolidated column of one channel.
    pub fn column(&self, name: &str) -> Option<&ChannelColumn> {
        self.columns.get(name)
    }

    pub fn pieces(&self) -> &[FramePiece] {
        &self.pieces
    }

    /// Channels dropped because their sample type changed between frames.
    pub fn skipped(&self) -> &BTreeSet<String> {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.pieces.is_empty()
    }

    pub fn finish(self) -> ExtractedData {
        match self.mode {
            ResponseMode::Consolidated => ExtractedData::Consolidated(self.columns),
            ResponseMode::Frames => ExtractedData::Frames(self.pieces),
        }
    }

    fn take(&mut self, chunk: u64, name: &str, frame: &Frame, samples: &Samples) -> usize {
        let result = match self.mode {
            ResponseMode::Consolidated => self
                .columns
                .entry(name.to_string())
                .or_insert_with(|| ChannelColumn::empty(samples.kind()))
                .push_within(&frame.time, samples, &self.window),
            ResponseMode::Frames => {
                let mut column = ChannelColumn::empty(samples.kind());
                let taken = column.push_within(&frame.time, samples, &self.window);
                if let Ok(n) = taken {
                    if n > 0 {
                        self.pieces.push(FramePiece {
                            chunk,
                            channel: name.to_string(),
                            column,
                        });
                    }
                }
                taken
            }
        };
        match result {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Dropping channel {} from extraction: {}", name, e);
                self.columns.remove(name);
                self.skipped.insert(name.to_string());
                0
            }
        }
    }
}

impl Extractor for DataExtractor {
    fn window(&self) -> &Window {
        &self.window
    }

    fn accept(&mut self, chunk: u64, frame: &Frame, pending: &mut BTreeSet<String>) -> bool {
        let mut took = false;
        for (name, samples) in &frame.channels {
            if !self.window.wants(name) || self.skipped.contains(name) {
                continue;
            }
            if self.take(chunk, name, frame, samples) > 0 {
                pending.remove(name);
                took = true;
            }
        }
        took
    }
}
