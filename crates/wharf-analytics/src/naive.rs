//! Exact counting baseline
//!
//! Keeps one exact counter per key. Memory grows with the number of
//! distinct keys, so this is only suitable for small streams; the
//! streaming counters use it as their correctness oracle in tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Entry, ReportBias};

/// Exact frequency counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NaiveCounter {
    counts: HashMap<String, u64>,
    observed: u64,
}

impl NaiveCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample.
    pub fn observe(&mut self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
        self.observed += 1;
    }

    /// Exact count for `key`, zero if never seen.
    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Keys whose exact frequency clears `threshold`.
    pub fn items_above_threshold(&self, threshold: f64, _bias: ReportBias) -> Vec<Entry> {
        let observed = self.observed as f64;
        let floor = threshold * observed;
        self.counts
            .iter()
            .filter(|(_, &count)| count as f64 >= floor)
            .map(|(key, &count)| Entry {
                key: key.clone(),
                frequency: count as f64 / observed,
            })
            .collect()
    }

    /// Total number of observations so far.
    pub fn observed(&self) -> u64 {
        self.observed
    }
}
