//! Per-channel time-range catalog
//!
//! Each chunk keeps a catalog of the spans its channels cover, and each series
//! keeps an aggregate catalog merged up from its chunks. Catalogs are caches:
//! they can always be rebuilt from the frames (or chunk summaries) below them.

use crate::storage::types::{Frame, Span};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Anything that can feed spans into a catalog.
pub trait CatalogSource {
    /// Visit every `(channel, span)` pair this source covers.
    fn visit_spans(&self, visit: &mut dyn FnMut(&str, Span));
}

impl CatalogSource for Frame {
    fn visit_spans(&self, visit: &mut dyn FnMut(&str, Span)) {
        let span = self.time.span();
        for name in self.channels.keys() {
            visit(name, span);
        }
    }
}

impl CatalogSource for TimeRangeCatalog {
    fn visit_spans(&self, visit: &mut dyn FnMut(&str, Span)) {
        for (name, spans) in &self.channels {
            for span in spans {
                visit(name, *span);
            }
        }
    }
}

/// Time coverage of one channel, as returned by [`TimeRangeCatalog::extract`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLimits {
    pub time_ranges: Vec<Span>,
    pub start_time: f64,
    pub duration: f64,
}

impl ChannelLimits {
    fn empty() -> Self {
        Self {
            time_ranges: Vec::new(),
            start_time: 0.0,
            duration: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.time_ranges.is_empty()
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Outer bounds, inclusive when the last span is.
    pub fn bounds(&self) -> Option<Span> {
        let last = self.time_ranges.last()?;
        Some(Span::new(self.start_time, self.end_time(), last.inclusive))
    }

    /// Where `reference` lies relative to these limits; `None` for an unknown channel.
    pub fn compare(&self, reference: f64) -> Option<Ordering> {
        self.bounds().map(|b| b.compare(reference))
    }
}

/// Map of channel name to its sorted, non-overlapping spans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeCatalog {
    channels: BTreeMap<String, Vec<Span>>,
}

impl TimeRangeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Time ranges of one channel. Unknown channels yield empty limits, never an error.
    pub fn extract(&self, name: &str) -> ChannelLimits {
        match self.channels.get(name) {
            Some(spans) if !spans.is_empty() => {
                let start = spans[0].start;
                let end = spans[spans.len() - 1].end;
                ChannelLimits {
                    time_ranges: spans.clone(),
                    start_time: start,
                    duration: end - start,
                }
            }
            _ => ChannelLimits::empty(),
        }
    }

    /// Merge `source` into this catalog and report whether anything changed.
    ///
    /// `reset` discards prior content first. `leaf_edit` replaces the spans of
    /// each channel the source mentions instead of merging into them.
    pub fn update_registration(
        &mut self,
        source: &dyn CatalogSource,
        reset: bool,
        leaf_edit: bool,
    ) -> bool {
        let previous = if reset || leaf_edit {
            Some(self.channels.clone())
        } else {
            None
        };
        if reset {
            self.channels.clear();
        }

        let mut replaced: Vec<String> = Vec::new();
        let mut changed = false;
        source.visit_spans(&mut |name, span| {
            if leaf_edit && !replaced.iter().any(|n| n == name) {
                self.channels.insert(name.to_string(), Vec::new());
                replaced.push(name.to_string());
            }
            let spans = self.channels.entry(name.to_string()).or_default();
            changed |= insert_span(spans, span);
        });

        match previous {
            Some(before) => before != self.channels,
            None => changed,
        }
    }

    /// Coarse copy: one span per channel covering all of its data.
    pub fn summarize(&self) -> TimeRangeCatalog {
        let channels = self
            .channels
            .iter()
            .filter_map(|(name, spans)| {
                let first = spans.first()?;
                let outer = spans.iter().fold(*first, |acc, s| acc.union(s));
                Some((name.clone(), vec![outer]))
            })
            .collect();
        TimeRangeCatalog { channels }
    }

    /// Span covering every channel.
    pub fn trange(&self) -> Option<Span> {
        self.channels
            .values()
            .flatten()
            .copied()
            .reduce(|acc, s| acc.union(&s))
    }
}

/// Insert `span` into sorted, coalesced `spans`. Returns whether the list changed.
fn insert_span(spans: &mut Vec<Span>, span: Span) -> bool {
    // Fast path: appending at or after the last span.
    if let Some(last) = spans.last_mut() {
        if span.start >= last.start && last.touches(&span) {
            let merged = last.union(&span);
            let changed = merged != *last;
            *last = merged;
            return changed;
        }
        if span.start > last.end {
            spans.push(span);
            return true;
        }
    } else {
        spans.push(span);
        return true;
    }

    let mut merged = span;
    let mut out = Vec::with_capacity(spans.len() + 1);
    let mut placed = false;
    for existing in spans.iter() {
        if existing.touches(&merged) {
            merged = merged.union(existing);
        } else if existing.end < merged.start {
            out.push(*existing);
        } else {
            if !placed {
                out.push(merged);
                placed = true;
            }
            out.push(*existing);
        }
    }
    if !placed {
        out.push(merged);
    }
    let changed = out != *spans;
    *spans = out;
    changed
}
