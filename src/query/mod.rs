//! Ringstore query model
//!
//! - **Time-relative**: "where is T relative to the data for these channels?"
//!   queries and their status-coded matches
//! - **Request**: the descriptor a consumer hands the engine (reference mode,
//!   relational operator, domain, repetitions, response mode)
//! - **Extract**: windows and the extractor contract chunks feed samples into
//!
//! # Example
//!
//! ```rust,ignore
//! use ringstore::query::{Relationship, TimeRelativeQuery};
//!
//! let query = TimeRelativeQuery::new(1_700_000_000.0, Relationship::AtOrAfter)
//!     .channel("station/temp");
//! let found = series.match_time_relative(&query).await?;
//! if let Some(window) = found.to_window(&query, 60.0) {
//!     let data = series.extract(window, ResponseMode::Consolidated).await?;
//! }
//! ```

pub mod extract;
mod request;
mod time_relative;

pub use extract::{
    ChannelColumn, DataExtractor, ExtractedData, Extractor, FramePiece, MatchReason, Window,
};
pub use request::{
    Domain, ReferenceMode, RelationalOperator, Repetitions, RequestDescriptor, ResponseMode,
};
pub use time_relative::{MatchStatus, Relationship, TimeRelativeMatch, TimeRelativeQuery};
