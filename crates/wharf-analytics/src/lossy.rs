//! Lossy Counting
//!
//! Manku-Motwani lossy counting over a stream divided into buckets of width
//! `ceil(1/tolerance)`. Every key whose true frequency is at least
//! `support * N` is reported; nothing below `(support - tolerance) * N` is
//! reported; counts underestimate by at most `tolerance * N`.
//!
//! One deliberate quirk is carried over from the previous implementation of
//! this pipeline: the delta recorded on first insertion is `bucket - 1`
//! rather than the canonical `bucket`. Pruning is correspondingly one bucket
//! more aggressive. Persisted counters encode that delta, so changing it
//! would silently re-weight rehydrated state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CounterError;
use crate::{Entry, ReportBias};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CountDelta {
    count: f64,
    delta: f64,
}

/// Deterministic lossy counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossyCounter {
    support: f64,
    error_tolerance: f64,
    entries: HashMap<String, CountDelta>,
    observed: u64,
    bucket_width: u64,
}

impl LossyCounter {
    /// Create a counter with the given support and error tolerance.
    ///
    /// Fails unless `0 < tolerance < support < 1`.
    pub fn new(support: f64, error_tolerance: f64) -> Result<Self, CounterError> {
        if !(support > 0.0 && support < 1.0) {
            return Err(CounterError::InvalidSupport(support));
        }
        if error_tolerance <= 0.0 || error_tolerance >= support {
            return Err(CounterError::InvalidTolerance {
                support,
                tolerance: error_tolerance,
            });
        }
        Ok(Self {
            support,
            error_tolerance,
            entries: HashMap::new(),
            observed: 0,
            bucket_width: (1.0 / error_tolerance).ceil() as u64,
        })
    }

    /// Record one sample.
    pub fn observe(&mut self, key: &str) {
        self.observed += 1;
        let bucket = self.observed / self.bucket_width;
        match self.entries.get_mut(key) {
            Some(entry) => entry.count += 1.0,
            None => {
                self.entries.insert(
                    key.to_string(),
                    CountDelta {
                        count: 1.0,
                        delta: bucket as f64 - 1.0,
                    },
                );
            }
        }
        if self.observed % self.bucket_width == 0 {
            self.prune(bucket as f64);
        }
    }

    fn prune(&mut self, bucket: f64) {
        self.entries.retain(|_, entry| entry.count + entry.delta > bucket);
    }

    /// Keys whose estimated frequency clears `threshold`, with `threshold`
    /// in `[0, 1]`.
    pub fn items_above_threshold(&self, threshold: f64, bias: ReportBias) -> Vec<Entry> {
        let observed = self.observed as f64;
        self.entries
            .iter()
            .filter(|(_, entry)| entry.count >= (threshold - self.error_tolerance) * observed)
            .map(|(key, entry)| Entry {
                key: key.clone(),
                frequency: match bias {
                    ReportBias::SupportBiased => entry.count / observed + self.support,
                    ReportBias::Unbiased => entry.count / observed,
                },
            })
            .collect()
    }

    /// Total number of observations so far.
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::naive::NaiveCounter;

    fn frequencies(entries: &[Entry]) -> HashMap<&str, f64> {
        entries.iter().map(|e| (e.key.as_str(), e.frequency)).collect()
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(LossyCounter::new(0.0, 0.001).is_err());
        assert!(LossyCounter::new(1.0, 0.001).is_err());
        assert!(LossyCounter::new(0.01, 0.0).is_err());
        assert!(LossyCounter::new(0.01, 0.01).is_err());
        assert!(LossyCounter::new(0.01, 0.02).is_err());
        assert!(LossyCounter::new(0.01, 0.001).is_ok());
    }

    #[test]
    fn test_first_bucket_delta_is_minus_one() {
        let mut lc = LossyCounter::new(0.1, 0.01).unwrap();
        lc.observe("a");
        let doc = serde_json::to_value(&lc).unwrap();
        assert_eq!(doc["entries"]["a"]["delta"], serde_json::json!(-1.0));
    }

    #[test]
    fn test_heavy_hitters_are_reported() {
        // w = 100 buckets; "hot" takes 30% of a 10k stream, noise keys
        // appear once each.
        let mut lc = LossyCounter::new(0.1, 0.01).unwrap();
        let mut oracle = NaiveCounter::new();
        for i in 0..10_000u64 {
            let key = if i % 10 < 3 {
                "hot".to_string()
            } else {
                format!("noise-{i}")
            };
            lc.observe(&key);
            oracle.observe(&key);
        }

        let reported = lc.items_above_threshold(0.1, ReportBias::Unbiased);
        let reported = frequencies(&reported);
        assert!(reported.contains_key("hot"));

        // No key below (s - tolerance) * N may appear.
        for key in reported.keys() {
            assert!(oracle.count(key) as f64 >= (0.1 - 0.01) * 10_000.0, "spurious key {key}");
        }
    }

    #[test]
    fn test_count_error_is_bounded() {
        let mut lc = LossyCounter::new(0.05, 0.005).unwrap();
        let mut oracle = NaiveCounter::new();
        // Three heavy keys with distinct rates plus rotating noise.
        for i in 0..50_000u64 {
            let key = match i % 20 {
                0..=4 => "alpha".to_string(),
                5..=7 => "beta".to_string(),
                8..=9 => "gamma".to_string(),
                _ => format!("noise-{}", i % 4_000),
            };
            lc.observe(&key);
            oracle.observe(&key);
        }

        let n = 50_000.0;
        for entry in lc.items_above_threshold(0.05, ReportBias::Unbiased) {
            let true_count = oracle.count(&entry.key) as f64;
            let estimate = entry.frequency * n;
            assert!(estimate <= true_count + 1e-6, "overestimate for {}", entry.key);
            // One extra bucket of slack for the delta = bucket - 1 quirk.
            assert!(
                estimate >= true_count - 0.005 * n - 1.0,
                "underestimate beyond tolerance for {}",
                entry.key
            );
        }
    }

    #[test]
    fn test_support_bias_shifts_frequency() {
        let mut lc = LossyCounter::new(0.1, 0.01).unwrap();
        for _ in 0..100 {
            lc.observe("k");
        }
        let unbiased = lc.items_above_threshold(0.5, ReportBias::Unbiased);
        let biased = lc.items_above_threshold(0.5, ReportBias::SupportBiased);
        assert_eq!(unbiased.len(), 1);
        assert_eq!(biased.len(), 1);
        assert!((biased[0].frequency - unbiased[0].frequency - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_prune_drops_infrequent_keys() {
        let mut lc = LossyCounter::new(0.1, 0.01).unwrap();
        // One full bucket of singletons: every entry has count 1 and
        // delta -1, so the first prune clears them all.
        for i in 0..100u64 {
            lc.observe(&format!("one-shot-{i}"));
        }
        assert_eq!(lc.tracked(), 0);
        assert_eq!(lc.observed(), 100);
    }
}
