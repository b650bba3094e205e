//! Core data types for the ringstore storage engine
//!
//! - `Span`: a closed or half-open interval on the time axis
//! - `TimeRange`: the time coverage of a frame (evenly spaced or explicit point times)
//! - `FrameRange`: frame-index coverage of a frame
//! - `Samples`: a typed column of channel samples
//! - `Frame`: one ingested unit, a time range plus a map of channel columns

use crate::query::{Relationship, TimeRelativeMatch};
use crate::storage::error::{StorageError, StorageResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Tolerance used when locating the point that contains a reference time.
const POINT_EPSILON: f64 = 5e-14;

/// An interval `[start, end]` (or `[start, end)` when not inclusive).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub start: f64,
    pub end: f64,
    pub inclusive: bool,
}

impl Span {
    pub fn new(start: f64, end: f64, inclusive: bool) -> Self {
        Self { start, end, inclusive }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Where `reference` lies relative to this span.
    ///
    /// `Less` means the reference precedes the span, `Greater` that it follows it.
    /// The end instant of a non-inclusive span counts as following it.
    pub fn compare(&self, reference: f64) -> Ordering {
        if reference < self.start {
            Ordering::Less
        } else if reference > self.end || (reference == self.end && !self.inclusive) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    pub fn contains(&self, time: f64) -> bool {
        self.compare(time) == Ordering::Equal
    }

    /// True when the spans overlap or touch end-to-start.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &Span) -> Span {
        let start = self.start.min(other.start);
        let (end, inclusive) = match self.end.partial_cmp(&other.end) {
            Some(Ordering::Greater) => (self.end, self.inclusive),
            Some(Ordering::Less) => (other.end, other.inclusive),
            _ => (self.end, self.inclusive || other.inclusive),
        };
        Span { start, end, inclusive }
    }
}

/// Time coverage of a frame.
///
/// With a single entry in `times` the samples are spread evenly over `duration`.
/// With several entries each sample sits at its own time and lasts `duration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    times: Vec<f64>,
    duration: f64,
    inclusive: bool,
}

impl TimeRange {
    /// Evenly spaced range starting at `start`.
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            times: vec![start],
            duration: duration.max(0.0),
            inclusive: false,
        }
    }

    /// A single instant.
    pub fn instant(time: f64) -> Self {
        Self::new(time, 0.0)
    }

    /// Instant at the current wall-clock time.
    pub fn now() -> Self {
        Self::instant(Utc::now().timestamp_millis() as f64 / 1000.0)
    }

    /// Explicit point times, each lasting `duration`. Times must be non-empty and non-decreasing.
    pub fn points(times: Vec<f64>, duration: f64) -> StorageResult<Self> {
        if times.is_empty() {
            return Err(StorageError::InvalidFrame(
                "point time list is empty".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(StorageError::InvalidFrame(
                "point times must be non-decreasing".to_string(),
            ));
        }
        Ok(Self {
            times,
            duration: duration.max(0.0),
            inclusive: false,
        })
    }

    /// Builder method: mark the end instant as part of the range
    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    pub fn start(&self) -> f64 {
        self.times[0]
    }

    pub fn end(&self) -> f64 {
        self.times[self.times.len() - 1] + self.duration
    }

    /// Whole duration covered by the range.
    pub fn duration(&self) -> f64 {
        self.end() - self.start()
    }

    pub fn is_evenly_spaced(&self) -> bool {
        self.times.len() == 1
    }

    /// Number of explicit point times (1 for evenly spaced ranges).
    pub fn point_count(&self) -> usize {
        self.times.len()
    }

    /// Duration of one of `n` samples.
    pub fn point_duration(&self, n: usize) -> f64 {
        if self.is_evenly_spaced() && n > 0 {
            self.duration / n as f64
        } else {
            self.duration
        }
    }

    /// Start time of each of `n` samples.
    pub fn point_times(&self, n: usize) -> Vec<f64> {
        if self.is_evenly_spaced() {
            let step = self.point_duration(n);
            (0..n).map(|i| self.times[0] + i as f64 * step).collect()
        } else {
            self.times.clone()
        }
    }

    /// Zero-length ranges always include their instant.
    pub fn span(&self) -> Span {
        Span::new(
            self.start(),
            self.end(),
            self.inclusive || self.duration == 0.0,
        )
    }

    /// Locate `reference` among `n` samples of this range.
    ///
    /// Returns status 0 with the resolved time when a qualifying sample exists,
    /// -1 when none precedes the reference and 1 when none follows it.
    /// The resolved time is a sample end (`invert = true`) for BEFORE/AT_OR_BEFORE.
    pub fn match_time_relative(
        &self,
        relationship: Relationship,
        reference: f64,
        n: usize,
    ) -> TimeRelativeMatch {
        if n == 0 {
            return TimeRelativeMatch::after();
        }
        let count = if self.is_evenly_spaced() { n } else { self.times.len() };
        let step = self.point_duration(n);
        let time_of = |i: usize| -> f64 {
            if self.is_evenly_spaced() {
                self.times[0] + i as f64 * step
            } else {
                self.times[i]
            }
        };

        // Index of the last point starting at or before the reference.
        let containing: Option<usize> = if reference < self.start() {
            None
        } else if self.is_evenly_spaced() {
            if step == 0.0 {
                Some(count - 1)
            } else {
                let point = ((reference - self.start()) / step + POINT_EPSILON).floor() as usize;
                Some(point.min(count - 1))
            }
        } else {
            self.times
                .partition_point(|&t| t <= reference)
                .checked_sub(1)
        };

        match relationship {
            Relationship::Before => {
                let prior = if step == 0.0 {
                    // instants: last point strictly earlier than the reference
                    if !self.is_evenly_spaced() {
                        self.times.partition_point(|&t| t < reference).checked_sub(1)
                    } else if self.start() < reference {
                        Some(count - 1)
                    } else {
                        None
                    }
                } else {
                    containing.and_then(|k| k.checked_sub(1))
                };
                match prior {
                    Some(j) => TimeRelativeMatch::exact(time_of(j) + step, true),
                    None => TimeRelativeMatch::before(),
                }
            }
            Relationship::AtOrBefore => match containing {
                Some(k) => TimeRelativeMatch::exact(time_of(k) + step, true),
                None => TimeRelativeMatch::before(),
            },
            Relationship::AtOrAfter => {
                let next = match containing {
                    Some(k) if time_of(k) == reference => k,
                    Some(k) => k + 1,
                    None => 0,
                };
                if next < count {
                    TimeRelativeMatch::exact(time_of(next), false)
                } else {
                    TimeRelativeMatch::after()
                }
            }
            Relationship::After => {
                let next = containing.map_or(0, |k| k + 1);
                if next < count {
                    TimeRelativeMatch::exact(time_of(next), false)
                } else {
                    TimeRelativeMatch::after()
                }
            }
        }
    }
}

/// Frame-index coverage: `count` frames starting at `start`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u64,
    pub count: u64,
}

impl FrameRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &FrameRange) -> FrameRange {
        let start = self.start.min(other.start);
        FrameRange::new(start, self.end().max(other.end()) - start)
    }
}

/// Type tag of a sample column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SampleKind {
    Float64,
    Int64,
    Bytes,
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleKind::Float64 => write!(f, "float64"),
            SampleKind::Int64 => write!(f, "int64"),
            SampleKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// A typed column of channel samples
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Samples {
    Float64(Vec<f64>),
    Int64(Vec<i64>),
    Bytes(Vec<Vec<u8>>),
}

impl Samples {
    pub fn kind(&self) -> SampleKind {
        match self {
            Samples::Float64(_) => SampleKind::Float64,
            Samples::Int64(_) => SampleKind::Int64,
            Samples::Bytes(_) => SampleKind::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::Float64(v) => v.len(),
            Samples::Int64(v) => v.len(),
            Samples::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty column of the given kind.
    pub fn empty(kind: SampleKind) -> Self {
        match kind {
            SampleKind::Float64 => Samples::Float64(Vec::new()),
            SampleKind::Int64 => Samples::Int64(Vec::new()),
            SampleKind::Bytes => Samples::Bytes(Vec::new()),
        }
    }

    /// Append `other` to this column. Fails when the kinds differ.
    pub fn extend_from(&mut self, other: &Samples) -> StorageResult<()> {
        match (self, other) {
            (Samples::Float64(a), Samples::Float64(b)) => a.extend_from_slice(b),
            (Samples::Int64(a), Samples::Int64(b)) => a.extend_from_slice(b),
            (Samples::Bytes(a), Samples::Bytes(b)) => a.extend(b.iter().cloned()),
            (this, other) => {
                return Err(StorageError::InvalidFrame(format!(
                    "cannot append {} samples to a {} column",
                    other.kind(),
                    this.kind()
                )))
            }
        }
        Ok(())
    }

    /// Column holding only the samples at `indices`.
    pub fn select(&self, indices: &[usize]) -> Samples {
        match self {
            Samples::Float64(v) => Samples::Float64(indices.iter().map(|&i| v[i]).collect()),
            Samples::Int64(v) => Samples::Int64(indices.iter().map(|&i| v[i]).collect()),
            Samples::Bytes(v) => Samples::Bytes(indices.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    /// In-memory payload size in bytes.
    pub fn estimated_size(&self) -> usize {
        match self {
            Samples::Float64(v) => v.len() * 8,
            Samples::Int64(v) => v.len() * 8,
            Samples::Bytes(v) => v.iter().map(|b| b.len() + 8).sum(),
        }
    }
}

/// One ingested unit: a time range and the channel columns sampled over it.
///
/// Channel names are `/`-separated paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub time: TimeRange,
    pub frames: Option<FrameRange>,
    pub channels: BTreeMap<String, Samples>,
}

impl Frame {
    pub fn new(time: TimeRange) -> Self {
        Self {
            time,
            frames: None,
            channels: BTreeMap::new(),
        }
    }

    /// Builder method: add a channel column
    pub fn channel(mut self, name: impl Into<String>, samples: Samples) -> Self {
        self.channels.insert(name.into(), samples);
        self
    }

    /// Builder method: set the frame-index range
    pub fn frame_range(mut self, frames: FrameRange) -> Self {
        self.frames = Some(frames);
        self
    }

    /// A single channel with a flat name, stored without deep merging.
    pub fn is_single_channel(&self) -> bool {
        self.channels.len() == 1
            && self
                .channels
                .keys()
                .next()
                .map_or(false, |name| !name.contains('/'))
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn estimated_size(&self) -> usize {
        self.channels
            .iter()
            .map(|(name, samples)| name.len() + samples.estimated_size())
            .sum::<usize>()
            + 48
    }

    /// Reject frames the storage layer cannot index.
    pub fn validate(&self) -> StorageResult<()> {
        if self.channels.is_empty() {
            return Err(StorageError::InvalidFrame("frame has no channels".to_string()));
        }
        if !self.time.start().is_finite() || !self.time.end().is_finite() {
            return Err(StorageError::InvalidFrame("frame time is not finite".to_string()));
        }
        for (name, samples) in &self.channels {
            if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
                return Err(StorageError::InvalidFrame(format!(
                    "invalid channel name {:?}",
                    name
                )));
            }
            if samples.is_empty() {
                return Err(StorageError::InvalidFrame(format!(
                    "channel {} has no samples",
                    name
                )));
            }
            if !self.time.is_evenly_spaced() && samples.len() != self.time.point_count() {
                return Err(StorageError::InvalidFrame(format!(
                    "channel {} has {} samples for {} point times",
                    name,
                    samples.len(),
                    self.time.point_count()
                )));
            }
        }
        Ok(())
    }

    /// Merge another frame covering the same time into this one.
    /// Fails when both frames carry the same channel.
    pub fn absorb(&mut self, other: Frame) -> StorageResult<()> {
        if let Some(name) = other.channels.keys().find(|n| self.channels.contains_key(*n)) {
            return Err(StorageError::InvalidFrame(format!(
                "channel {} already present at time {}",
                name,
                self.time.start()
            )));
        }
        self.frames = match (self.frames, other.frames) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
        self.channels.extend(other.channels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MatchStatus;

    #[test]
    fn test_span_compare() {
        let span = Span::new(10.0, 20.0, false);
        assert_eq!(span.compare(9.0), Ordering::Less);
        assert_eq!(span.compare(10.0), Ordering::Equal);
        assert_eq!(span.compare(19.9), Ordering::Equal);
        assert_eq!(span.compare(20.0), Ordering::Greater);

        let inclusive = Span::new(10.0, 20.0, true);
        assert_eq!(inclusive.compare(20.0), Ordering::Equal);
    }

    #[test]
    fn test_zero_length_range_includes_instant() {
        let range = TimeRange::instant(5.0);
        assert_eq!(range.span().compare(5.0), Ordering::Equal);
    }

    #[test]
    fn test_point_times_evenly_spaced() {
        let range = TimeRange::new(100.0, 10.0);
        assert_eq!(range.point_times(5), vec![100.0, 102.0, 104.0, 106.0, 108.0]);
        assert_eq!(range.point_duration(5), 2.0);
        assert_eq!(range.end(), 110.0);
    }

    #[test]
    fn test_match_instant() {
        let range = TimeRange::instant(5.0);
        let m = range.match_time_relative(Relationship::AtOrBefore, 5.0, 1);
        assert_eq!(m.status, MatchStatus::Exact);
        assert_eq!(m.time, 5.0);
        assert!(m.invert);

        let m = range.match_time_relative(Relationship::AtOrAfter, 5.0, 1);
        assert_eq!(m.status, MatchStatus::Exact);
        assert!(!m.invert);

        assert_eq!(
            range.match_time_relative(Relationship::Before, 5.0, 1).status,
            MatchStatus::Before
        );
        assert_eq!(
            range.match_time_relative(Relationship::After, 5.0, 1).status,
            MatchStatus::After
        );
    }

    #[test]
    fn test_match_evenly_spaced() {
        // ten one-second samples starting at 0
        let range = TimeRange::new(0.0, 10.0);

        let m = range.match_time_relative(Relationship::AtOrAfter, 3.5, 10);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 4.0));

        let m = range.match_time_relative(Relationship::AtOrAfter, 3.0, 10);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 3.0));

        let m = range.match_time_relative(Relationship::After, 3.0, 10);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 4.0));

        let m = range.match_time_relative(Relationship::AtOrBefore, 3.5, 10);
        assert_eq!((m.status, m.time, m.invert), (MatchStatus::Exact, 4.0, true));

        let m = range.match_time_relative(Relationship::Before, 3.5, 10);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 3.0));

        let m = range.match_time_relative(Relationship::Before, 0.5, 10);
        assert_eq!(m.status, MatchStatus::Before);

        let m = range.match_time_relative(Relationship::After, 9.5, 10);
        assert_eq!(m.status, MatchStatus::After);
    }

    #[test]
    fn test_match_explicit_points() {
        let range = TimeRange::points(vec![1.0, 2.0, 4.0, 8.0], 0.0).unwrap();

        let m = range.match_time_relative(Relationship::Before, 4.0, 4);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 2.0));

        let m = range.match_time_relative(Relationship::AtOrBefore, 5.0, 4);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 4.0));

        let m = range.match_time_relative(Relationship::AtOrAfter, 5.0, 4);
        assert_eq!((m.status, m.time), (MatchStatus::Exact, 8.0));

        let m = range.match_time_relative(Relationship::After, 8.0, 4);
        assert_eq!(m.status, MatchStatus::After);
    }

    #[test]
    fn test_points_must_be_ordered() {
        assert!(TimeRange::points(vec![2.0, 1.0], 0.0).is_err());
        assert!(TimeRange::points(vec![], 0.0).is_err());
    }

    #[test]
    fn test_samples_type_mismatch() {
        let mut a = Samples::Float64(vec![1.0]);
        assert!(a.extend_from(&Samples::Int64(vec![2])).is_err());
        a.extend_from(&Samples::Float64(vec![2.0])).unwrap();
        assert_eq!(a, Samples::Float64(vec![1.0, 2.0]));
    }

    #[test]
    fn test_frame_validation() {
        let frame = Frame::new(TimeRange::new(0.0, 1.0));
        assert!(frame.validate().is_err());

        let frame = Frame::new(TimeRange::points(vec![0.0, 1.0], 0.0).unwrap())
            .channel("temp", Samples::Float64(vec![1.0]));
        assert!(frame.validate().is_err());

        let frame = Frame::new(TimeRange::new(0.0, 1.0))
            .channel("temp", Samples::Float64(vec![1.0, 2.0]));
        assert!(frame.validate().is_ok());
        assert!(frame.is_single_channel());

        let nested = Frame::new(TimeRange::new(0.0, 1.0))
            .channel("station/temp", Samples::Float64(vec![1.0]));
        assert!(!nested.is_single_channel());
    }

    #[test]
    fn test_frame_absorb() {
        let mut a = Frame::new(TimeRange::new(0.0, 1.0)).channel("a", Samples::Int64(vec![1]));
        let b = Frame::new(TimeRange::new(0.0, 1.0)).channel("b", Samples::Int64(vec![2]));
        a.absorb(b).unwrap();
        assert_eq!(a.channels.len(), 2);

        let dup = Frame::new(TimeRange::new(0.0, 1.0)).channel("a", Samples::Int64(vec![3]));
        assert!(a.absorb(dup).is_err());
    }
}
