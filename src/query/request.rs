//! Request descriptors
//!
//! A [`RequestDescriptor`] is what a consumer hands the matching engine: a time
//! reference (absolute or relative to the retained data), a relational operator,
//! a domain, repetitions and a response mode. Wire codes of the enums are stable.

use crate::query::extract::Window;
use crate::query::time_relative::{Relationship, TimeRelativeQuery};
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroU64;

/// What the request's start time is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Start is an absolute time
    #[default]
    Absolute,
    /// Start is an offset back from the newest data
    Newest,
    /// Start is an offset forward from the oldest data
    Oldest,
    /// Newest data, but only if it starts after the given time
    After,
    /// Newest data, like `Newest`
    Modified,
    /// Newest whole multiple of the duration
    Aligned,
}

impl ReferenceMode {
    pub fn code(&self) -> u8 {
        match self {
            ReferenceMode::Absolute => 0,
            ReferenceMode::Newest => 1,
            ReferenceMode::Oldest => 2,
            ReferenceMode::After => 3,
            ReferenceMode::Modified => 4,
            ReferenceMode::Aligned => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReferenceMode::Absolute),
            1 => Some(ReferenceMode::Newest),
            2 => Some(ReferenceMode::Oldest),
            3 => Some(ReferenceMode::After),
            4 => Some(ReferenceMode::Modified),
            5 => Some(ReferenceMode::Aligned),
            _ => None,
        }
    }
}

/// Relation of the wanted data to the reference time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationalOperator {
    #[default]
    Equal,
    GreaterEqual,
    Greater,
    LessEqual,
    Less,
}

impl RelationalOperator {
    pub fn code(&self) -> i8 {
        match self {
            RelationalOperator::Equal => 0,
            RelationalOperator::GreaterEqual => 1,
            RelationalOperator::Greater => 2,
            RelationalOperator::LessEqual => -1,
            RelationalOperator::Less => -2,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(RelationalOperator::Equal),
            1 => Some(RelationalOperator::GreaterEqual),
            2 => Some(RelationalOperator::Greater),
            -1 => Some(RelationalOperator::LessEqual),
            -2 => Some(RelationalOperator::Less),
            _ => None,
        }
    }

    /// Time-relative counterpart; `None` for EQUAL, which needs no search.
    pub fn relationship(&self) -> Option<Relationship> {
        match self {
            RelationalOperator::Equal => None,
            RelationalOperator::GreaterEqual => Some(Relationship::AtOrAfter),
            RelationalOperator::Greater => Some(Relationship::After),
            RelationalOperator::LessEqual => Some(Relationship::AtOrBefore),
            RelationalOperator::Less => Some(Relationship::Before),
        }
    }
}

/// Whether retained data, future data, or both are wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    #[default]
    All,
    Existing,
    Future,
}

impl Domain {
    pub fn code(&self) -> u8 {
        match self {
            Domain::All => 0,
            Domain::Existing => 1,
            Domain::Future => 2,
        }
    }

    pub fn includes_existing(&self) -> bool {
        !matches!(self, Domain::Future)
    }
}

/// Shape of the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// One column per channel
    #[default]
    Consolidated,
    /// One piece per source frame
    Frames,
}

impl ResponseMode {
    pub fn code(&self) -> u8 {
        match self {
            ResponseMode::Consolidated => 0,
            ResponseMode::Frames => 1,
        }
    }
}

/// How many times a request is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repetitions {
    Count(NonZeroU64),
    /// Live streaming
    Infinite,
}

impl Repetitions {
    pub fn once() -> Self {
        Repetitions::Count(NonZeroU64::MIN)
    }

    /// Whether repetition `n` (0-based) is still due.
    pub fn allows(&self, n: u64) -> bool {
        match self {
            Repetitions::Count(count) => n < count.get(),
            Repetitions::Infinite => true,
        }
    }
}

impl Default for Repetitions {
    fn default() -> Self {
        Self::once()
    }
}

/// A consumer's data request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub start: f64,
    pub duration: f64,
    pub channels: BTreeSet<String>,
    pub reference: ReferenceMode,
    pub relationship: RelationalOperator,
    pub domain: Domain,
    repetitions: Repetitions,
    increment: f64,
    pub mode: ResponseMode,
    pub synchronized_channels: bool,
    pub gap_control: bool,
}

impl RequestDescriptor {
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            start,
            duration,
            channels: BTreeSet::new(),
            reference: ReferenceMode::default(),
            relationship: RelationalOperator::default(),
            domain: Domain::default(),
            repetitions: Repetitions::default(),
            increment: 0.0,
            mode: ResponseMode::default(),
            synchronized_channels: false,
            gap_control: false,
        }
    }

    /// Newest `duration` seconds of data.
    pub fn newest(duration: f64) -> Self {
        Self::new(0.0, duration).reference(ReferenceMode::Newest)
    }

    /// Oldest `duration` seconds of data.
    pub fn oldest(duration: f64) -> Self {
        Self::new(0.0, duration).reference(ReferenceMode::Oldest)
    }

    /// Builder method: add a channel
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channels.insert(name.into());
        self
    }

    /// Builder method: set the time reference
    pub fn reference(mut self, reference: ReferenceMode) -> Self {
        self.reference = reference;
        self
    }

    /// Builder method: set the relational operator
    pub fn relationship(mut self, relationship: RelationalOperator) -> Self {
        self.relationship = relationship;
        self
    }

    /// Builder method: set the domain
    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    /// Builder method: set the response mode
    pub fn mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method: set the channel synchronization and gap control flags
    pub fn flags(mut self, synchronized_channels: bool, gap_control: bool) -> Self {
        self.synchronized_channels = synchronized_channels;
        self.gap_control = gap_control;
        self
    }

    /// Repeat the request `count` times, moving by `increment` seconds after the first.
    pub fn repeat(mut self, count: u64, increment: f64) -> StorageResult<Self> {
        let count = NonZeroU64::new(count).ok_or_else(|| {
            StorageError::InvalidRequest("the number of repetitions must be positive".to_string())
        })?;
        self.repetitions = Repetitions::Count(count);
        self.increment = increment;
        Ok(self)
    }

    /// Repeat forever (live streaming).
    pub fn repeat_forever(mut self, increment: f64) -> Self {
        self.repetitions = Repetitions::Infinite;
        self.increment = increment;
        self
    }

    pub fn repetitions(&self) -> Repetitions {
        self.repetitions
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }

    pub fn validate(&self) -> StorageResult<()> {
        if !self.start.is_finite() || !self.duration.is_finite() || !self.increment.is_finite() {
            return Err(StorageError::InvalidRequest(
                "request times must be finite".to_string(),
            ));
        }
        if self.duration < 0.0 {
            return Err(StorageError::InvalidRequest(format!(
                "negative duration {}",
                self.duration
            )));
        }
        Ok(())
    }

    /// The time-relative search an ABSOLUTE request with a non-EQUAL operator needs.
    pub fn to_time_relative_query(&self) -> Option<TimeRelativeQuery> {
        if self.reference != ReferenceMode::Absolute {
            return None;
        }
        let relationship = self.relationship.relationship()?;
        Some(TimeRelativeQuery::new(self.start, relationship).channels(self.channels.iter().cloned()))
    }

    /// Request answering repetition `n` (0-based), or `None` once repetitions are exhausted.
    ///
    /// Without an increment the request repeats unchanged. With one, repetitions
    /// after the first become ABSOLUTE EQUAL requests `n * increment` after
    /// `first`, the window the first repetition resolved to.
    pub fn repetition(&self, first: &Window, n: u64) -> Option<RequestDescriptor> {
        if !self.repetitions.allows(n) {
            return None;
        }
        if n == 0 || self.increment == 0.0 {
            return Some(self.clone());
        }
        let mut next = self.clone();
        next.start = first.start + n as f64 * self.increment;
        next.duration = first.duration;
        next.reference = ReferenceMode::Absolute;
        next.relationship = RelationalOperator::Equal;
        Some(next)
    }

    /// Window of repetition `n` when it follows from the first one without a
    /// new lookup: the first window itself, or the first shifted by the increment.
    pub fn repeat_window(&self, first: &Window, n: u64) -> Option<Window> {
        if !self.repetitions.allows(n) {
            return None;
        }
        Some(first.shifted(n as f64 * self.increment))
    }
}
