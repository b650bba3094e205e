//! Time-relative queries and their status-coded results
//!
//! A query asks where a reference time sits relative to stored data for a set of
//! channels ("the sample at or after T"). The answer is a status code plus the
//! resolved time of the matching sample boundary.

use crate::query::extract::Window;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Direction of a time-relative query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    Before,
    AtOrBefore,
    AtOrAfter,
    After,
}

impl Relationship {
    /// BEFORE and AT_OR_BEFORE look toward older data.
    pub fn looks_back(&self) -> bool {
        matches!(self, Relationship::Before | Relationship::AtOrBefore)
    }

    /// Sentinel used when a chunk holds nothing for the requested channels.
    pub(crate) fn boundary_status(&self) -> MatchStatus {
        if self.looks_back() {
            MatchStatus::BoundaryBefore
        } else {
            MatchStatus::BoundaryAfter
        }
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relationship::Before => write!(f, "before"),
            Relationship::AtOrBefore => write!(f, "at-or-before"),
            Relationship::AtOrAfter => write!(f, "at-or-after"),
            Relationship::After => write!(f, "after"),
        }
    }
}

impl std::str::FromStr for Relationship {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "before" | "lt" => Ok(Relationship::Before),
            "at-or-before" | "le" => Ok(Relationship::AtOrBefore),
            "at-or-after" | "ge" => Ok(Relationship::AtOrAfter),
            "after" | "gt" => Ok(Relationship::After),
            other => Err(format!("unknown relationship: {}", other)),
        }
    }
}

/// Outcome of a time-relative match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// A qualifying sample was found (code 0)
    Exact,
    /// The reference precedes all retained data (code -1)
    Before,
    /// The reference follows all retained data (code 1)
    After,
    /// Channels disagree on direction; split the query per channel (code -2)
    Disagree,
    /// Inconclusive, search earlier (code -3). Internal to cross-chunk search.
    BoundaryBefore,
    /// Inconclusive, search later (code 3). Internal to cross-chunk search.
    BoundaryAfter,
}

impl MatchStatus {
    /// Wire status code.
    pub fn code(&self) -> i8 {
        match self {
            MatchStatus::Exact => 0,
            MatchStatus::Before => -1,
            MatchStatus::After => 1,
            MatchStatus::Disagree => -2,
            MatchStatus::BoundaryBefore => -3,
            MatchStatus::BoundaryAfter => 3,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(MatchStatus::Exact),
            -1 => Some(MatchStatus::Before),
            1 => Some(MatchStatus::After),
            -2 => Some(MatchStatus::Disagree),
            -3 => Some(MatchStatus::BoundaryBefore),
            3 => Some(MatchStatus::BoundaryAfter),
            _ => None,
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, MatchStatus::BoundaryBefore | MatchStatus::BoundaryAfter)
    }

    /// Search direction: negative looks earlier, positive later, zero stops.
    pub(crate) fn direction(&self) -> i8 {
        match self {
            MatchStatus::Before | MatchStatus::BoundaryBefore => -1,
            MatchStatus::After | MatchStatus::BoundaryAfter => 1,
            MatchStatus::Exact | MatchStatus::Disagree => 0,
        }
    }
}

/// "Where is `reference` relative to the data for `channels`?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRelativeQuery {
    pub reference: f64,
    pub relationship: Relationship,
    pub channels: BTreeSet<String>,
}

impl TimeRelativeQuery {
    pub fn new(reference: f64, relationship: Relationship) -> Self {
        Self {
            reference,
            relationship,
            channels: BTreeSet::new(),
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

    /// One single-channel query per channel, used when the combined query disagrees.
    pub fn split(&self) -> Vec<TimeRelativeQuery> {
        self.channels
            .iter()
            .map(|name| TimeRelativeQuery::new(self.reference, self.relationship).channel(name.clone()))
            .collect()
    }
}

/// Result of a time-relative match
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRelativeMatch {
    pub status: MatchStatus,
    /// Resolved time; meaningful only for `MatchStatus::Exact`
    pub time: f64,
    /// The resolved time marks the end rather than the start of the matching interval
    pub invert: bool,
}

impl TimeRelativeMatch {
    pub fn exact(time: f64, invert: bool) -> Self {
        Self {
            status: MatchStatus::Exact,
            time,
            invert,
        }
    }

    pub fn with_status(status: MatchStatus) -> Self {
        Self {
            status,
            time: 0.0,
            invert: false,
        }
    }

    pub fn before() -> Self {
        Self::with_status(MatchStatus::Before)
    }

    pub fn after() -> Self {
        Self::with_status(MatchStatus::After)
    }

    pub fn disagree() -> Self {
        Self::with_status(MatchStatus::Disagree)
    }

    pub fn is_exact(&self) -> bool {
        self.status == MatchStatus::Exact
    }

    /// Extraction window of `duration` seconds anchored at the resolved time.
    ///
    /// Looking back, the window ends at the resolved time; otherwise it starts there.
    /// Returns `None` unless the match is exact.
    pub fn to_window(&self, query: &TimeRelativeQuery, duration: f64) -> Option<Window> {
        if !self.is_exact() {
            return None;
        }
        let start = if query.relationship.looks_back() {
            self.time - duration
        } else {
            self.time
        };
        Some(
            Window::new(start, duration)
                .channels(query.channels.iter().cloned())
                .reversed(self.invert),
        )
    }

    /// Merge per-channel matches into one.
    ///
    /// Differing statuses disagree. Exact matches resolve to the nearest time
    /// in the query direction (latest when looking back, earliest otherwise).
    pub fn combine(matches: &[TimeRelativeMatch], relationship: Relationship) -> Option<Self> {
        let first = *matches.first()?;
        if matches.iter().any(|m| m.status != first.status) {
            return Some(Self::disagree());
        }
        if !first.is_exact() {
            return Some(first);
        }
        matches.iter().copied().reduce(|a, b| {
            let prefer_b = if relationship.looks_back() {
                b.time > a.time
            } else {
                b.time < a.time
            };
            if prefer_b {
                b
            } else {
                a
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            MatchStatus::Exact,
            MatchStatus::Before,
            MatchStatus::After,
            MatchStatus::Disagree,
            MatchStatus::BoundaryBefore,
            MatchStatus::BoundaryAfter,
        ] {
            assert_eq!(MatchStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(MatchStatus::from_code(2), None);
    }

    #[test]
    fn test_relationship_parse() {
        assert_eq!("at-or-after".parse::<Relationship>(), Ok(Relationship::AtOrAfter));
        assert_eq!("AT_OR_BEFORE".parse::<Relationship>(), Ok(Relationship::AtOrBefore));
        assert!("equal".parse::<Relationship>().is_err());
    }

    #[test]
    fn test_to_window_looking_back() {
        let query = TimeRelativeQuery::new(10.0, Relationship::AtOrBefore).channel("a");
        let m = TimeRelativeMatch::exact(10.0, true);
        let window = m.to_window(&query, 4.0).unwrap();
        assert_eq!(window.start, 6.0);
        assert_eq!(window.duration, 4.0);
        assert!(window.reversed);
    }

    #[test]
    fn test_to_window_looking_forward() {
        let query = TimeRelativeQuery::new(10.0, Relationship::After).channel("a");
        let m = TimeRelativeMatch::exact(11.0, false);
        let window = m.to_window(&query, 4.0).unwrap();
        assert_eq!(window.start, 11.0);
        assert!(!window.reversed);

        assert!(TimeRelativeMatch::after().to_window(&query, 4.0).is_none());
    }

    #[test]
    fn test_combine() {
        let a = TimeRelativeMatch::exact(3.0, false);
        let b = TimeRelativeMatch::exact(2.0, false);
        let m = TimeRelativeMatch::combine(&[a, b], Relationship::AtOrAfter).unwrap();
        assert_eq!(m.time, 2.0);

        let m = TimeRelativeMatch::combine(&[a, b], Relationship::AtOrBefore).unwrap();
        assert_eq!(m.time, 3.0);

        let m = TimeRelativeMatch::combine(&[a, TimeRelativeMatch::after()], Relationship::After)
            .unwrap();
        assert_eq!(m.status, MatchStatus::Disagree);

        assert!(TimeRelativeMatch::combine(&[], Relationship::After).is_none());
    }

    #[test]
    fn test_split() {
        let query = TimeRelativeQuery::new(1.0, Relationship::After).channels(["a", "b"]);
        let parts = query.split();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|q| q.channels.len() == 1));
    }
}
