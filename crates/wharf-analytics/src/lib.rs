//! Wharf Analytics Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Approximate frequency counting over string streams.
//!
//! # Overview
//!
//! Event-schema analytics needs to answer "which keys occur in at least a
//! fraction `s` of the stream?" without holding the whole stream in memory.
//! This crate provides two interchangeable streaming heavy-hitter counters:
//!
//! - [`LossyCounter`]: deterministic Lossy Counting with buckets of width
//!   `ceil(1/tolerance)`
//! - [`StickySampler`]: randomized Sticky Sampling with failure
//!   probability `delta`
//!
//! Both sit behind the [`counter::Counter`] tagged union and are persisted
//! through a schema-tagged JSON document (see [`counter::FrequencyCounter`]).
//! An exact [`NaiveCounter`] is included as a baseline for small streams and
//! as the oracle in the test suite.
//!
//! Counters are single-threaded by design; wrap one in a lock if it must be
//! shared.
//!
//! # Example
//!
//! ```
//! use wharf_analytics::{CounterConfig, ReportBias};
//!
//! let config = CounterConfig::default();
//! let mut counter = config.build("tracks").unwrap();
//! for _ in 0..100 {
//!     counter.observe("page_view");
//! }
//! counter.observe("rare_event");
//! let hot = counter.items_above_threshold(0.5, ReportBias::SupportBiased);
//! assert_eq!(hot.len(), 1);
//! assert_eq!(hot[0].key, "page_view");
//! ```

pub mod counter;
pub mod error;
pub mod lossy;
pub mod naive;
pub mod sticky;

// Re-export commonly used types
pub use counter::{Counter, CounterConfig, CounterType, FrequencyCounter};
pub use error::CounterError;
pub use lossy::LossyCounter;
pub use naive::NaiveCounter;
pub use sticky::StickySampler;

use serde::{Deserialize, Serialize};

/// A reported heavy hitter: key plus estimated relative frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub frequency: f64,
}

/// How reported frequencies are computed.
///
/// The original analytics pipeline reported `count/N + support`, folding the
/// support into the estimate as a bias. Downstream consumers depend on those
/// numbers, so that stays the default; `Unbiased` reports the plain `count/N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportBias {
    #[default]
    SupportBiased,
    Unbiased,
}
