//! Sticky Sampling
//!
//! Randomized heavy-hitter estimation. The sampler admits new keys with
//! probability `1/r`, doubling `r` (and the window `t`) as the stream
//! grows, and prunes tracked counts with fair coin flips at every window
//! boundary. With failure probability `delta`, every key with true
//! frequency at least `support * N` is reported.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::CounterError;
use crate::{Entry, ReportBias};

fn entropy_rng() -> StdRng {
    StdRng::from_entropy()
}

/// Randomized sticky sampler.
///
/// The RNG is not part of the persisted state; a rehydrated sampler
/// continues with a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickySampler {
    support: f64,
    error_tolerance: f64,
    failure_prob: f64,
    counts: HashMap<String, f64>,
    /// Current sampling rate `r`; new keys are admitted with probability `1/r`.
    sampling_rate: f64,
    observed: f64,
    /// Observation count at which `r` doubles next.
    window: f64,
    #[serde(skip, default = "entropy_rng")]
    rng: StdRng,
}

impl StickySampler {
    /// Create a sampler with the given support, error tolerance, and
    /// failure probability.
    ///
    /// Fails unless `0 < tolerance < support < 1` and `0 < failure_prob < 1`.
    pub fn new(
        support: f64,
        error_tolerance: f64,
        failure_prob: f64,
    ) -> Result<Self, CounterError> {
        Self::with_rng(support, error_tolerance, failure_prob, entropy_rng())
    }

    /// Like [`StickySampler::new`] but with a caller-provided seed, for
    /// reproducible runs.
    pub fn with_seed(
        support: f64,
        error_tolerance: f64,
        failure_prob: f64,
        seed: u64,
    ) -> Result<Self, CounterError> {
        Self::with_rng(support, error_tolerance, failure_prob, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        support: f64,
        error_tolerance: f64,
        failure_prob: f64,
        rng: StdRng,
    ) -> Result<Self, CounterError> {
        if !(support > 0.0 && support < 1.0) {
            return Err(CounterError::InvalidSupport(support));
        }
        if error_tolerance <= 0.0 || error_tolerance >= support {
            return Err(CounterError::InvalidTolerance {
                support,
                tolerance: error_tolerance,
            });
        }
        if !(failure_prob > 0.0 && failure_prob < 1.0) {
            return Err(CounterError::InvalidFailureProbability(failure_prob));
        }
        let window = 2.0 / error_tolerance * (1.0 / (support * failure_prob)).ln();
        Ok(Self {
            support,
            error_tolerance,
            failure_prob,
            counts: HashMap::new(),
            sampling_rate: 1.0,
            observed: 0.0,
            window,
            rng,
        })
    }

    /// Record one sample.
    pub fn observe(&mut self, key: &str) {
        self.observed += 1.0;
        if self.observed > self.window {
            self.window *= 2.0;
            self.sampling_rate *= 2.0;
            self.prune();
        }
        if !self.counts.contains_key(key) {
            let admit = self.rng.gen::<f64>() <= 1.0 / self.sampling_rate;
            if !admit {
                return;
            }
        }
        *self.counts.entry(key.to_string()).or_insert(0.0) += 1.0;
    }

    /// Diminish every tracked count by a run of failed coin flips.
    ///
    /// Keys must be snapshotted first: the map is mutated while walking it.
    fn prune(&mut self) {
        let keys: Vec<String> = self.counts.keys().cloned().collect();
        for key in keys {
            loop {
                if self.rng.gen_bool(0.5) {
                    break;
                }
                let Some(count) = self.counts.get_mut(&key) else {
                    break;
                };
                *count -= 1.0;
                if *count <= 0.0 {
                    self.counts.remove(&key);
                    break;
                }
            }
        }
    }

    /// Keys whose estimated frequency clears `threshold`, with `threshold`
    /// in `[0, 1]`.
    pub fn items_above_threshold(&self, threshold: f64, bias: ReportBias) -> Vec<Entry> {
        self.counts
            .iter()
            .filter(|(_, &count)| count >= (threshold - self.error_tolerance) * self.observed)
            .map(|(key, &count)| Entry {
                key: key.clone(),
                frequency: match bias {
                    ReportBias::SupportBiased => count / self.observed + self.support,
                    ReportBias::Unbiased => count / self.observed,
                },
            })
            .collect()
    }

    /// Total number of observations so far.
    pub fn observed(&self) -> u64 {
        self.observed as u64
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(StickySampler::new(0.01, 0.1, 0.01).is_err());
        assert!(StickySampler::new(0.01, 0.0, 0.01).is_err());
        assert!(StickySampler::new(0.0, 0.001, 0.01).is_err());
        assert!(StickySampler::new(0.01, 0.001, 0.0).is_err());
        assert!(StickySampler::new(0.01, 0.001, 1.0).is_err());
        assert!(StickySampler::new(0.01, 0.001, 0.01).is_ok());
    }

    #[test]
    fn test_hot_key_survives_large_stream() {
        // One key at 2% of a million-item stream, everything else unique.
        let mut ss = StickySampler::with_seed(0.01, 0.001, 0.01, 7).unwrap();
        for i in 0..1_000_000u64 {
            if i % 50 == 0 {
                ss.observe("hot");
            } else {
                ss.observe(&format!("cold-{i}"));
            }
        }

        let reported = ss.items_above_threshold(0.01, ReportBias::Unbiased);
        assert!(
            reported.iter().any(|e| e.key == "hot"),
            "hot key missing from {reported:?}"
        );
        // Every cold key has true frequency 1e-6, far below
        // (support - tolerance) = 0.009, so none may be reported.
        assert!(reported.iter().all(|e| e.key == "hot"));
    }

    #[test]
    fn test_tracked_keys_stay_bounded() {
        let mut ss = StickySampler::with_seed(0.05, 0.01, 0.05, 11).unwrap();
        for i in 0..200_000u64 {
            ss.observe(&format!("unique-{i}"));
        }
        // Sampling admits roughly one key per r observations and pruning
        // halves survivors, so the tracked set stays far below the
        // distinct-key count.
        assert!(ss.tracked() < 10_000, "tracked {} keys", ss.tracked());
    }

    #[test]
    fn test_all_keys_tracked_before_first_window() {
        let mut ss = StickySampler::with_seed(0.1, 0.05, 0.1, 3).unwrap();
        // window = (2 / 0.05) * ln(1 / 0.01) = 184.2; stay below it.
        for i in 0..100u64 {
            ss.observe(&format!("k{}", i % 10));
        }
        // r is still 1, so every key was admitted with its exact count.
        assert_eq!(ss.tracked(), 10);
        let reported = ss.items_above_threshold(0.1, ReportBias::Unbiased);
        assert_eq!(reported.len(), 10);
        for entry in reported {
            assert!((entry.frequency - 0.1).abs() < 1e-12);
        }
    }
}
