//! Counter selection, configuration, and persistence
//!
//! [`Counter`] is the tagged union over the two streaming implementations;
//! [`FrequencyCounter`] pairs one with the name of the stream it watches and
//! round-trips through a schema-tagged JSON document of the shape
//! `{"Name": ..., "CounterType": ..., "Counter": {...}}`. Rehydration
//! dispatches on the `CounterType` tag.

use serde::{Deserialize, Serialize};

use crate::error::CounterError;
use crate::lossy::LossyCounter;
use crate::sticky::StickySampler;
use crate::{Entry, ReportBias};

/// Which streaming algorithm backs a counter.
///
/// The serialized names are load-bearing: they tag persisted counter
/// documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterType {
    #[serde(rename = "LossyCount")]
    LossyCount,
    #[serde(rename = "StickySamplerT")]
    StickySampler,
}

impl std::str::FromStr for CounterType {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LossyCount" => Ok(CounterType::LossyCount),
            "StickySamplerT" => Ok(CounterType::StickySampler),
            other => Err(CounterError::UnknownCounterType(other.to_string())),
        }
    }
}

/// One of the two interchangeable streaming counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "CounterType", content = "Counter")]
pub enum Counter {
    #[serde(rename = "LossyCount")]
    Lossy(LossyCounter),
    #[serde(rename = "StickySamplerT")]
    Sticky(StickySampler),
}

impl Counter {
    /// Record one sample.
    pub fn observe(&mut self, key: &str) {
        match self {
            Counter::Lossy(c) => c.observe(key),
            Counter::Sticky(c) => c.observe(key),
        }
    }

    /// Keys whose estimated frequency clears `threshold`.
    pub fn items_above_threshold(&self, threshold: f64, bias: ReportBias) -> Vec<Entry> {
        match self {
            Counter::Lossy(c) => c.items_above_threshold(threshold, bias),
            Counter::Sticky(c) => c.items_above_threshold(threshold, bias),
        }
    }

    /// Total number of observations so far.
    pub fn observed(&self) -> u64 {
        match self {
            Counter::Lossy(c) => c.observed(),
            Counter::Sticky(c) => c.observed(),
        }
    }
}

/// Counter parameters, env-overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub counter_type: CounterType,
    /// Reported keys appeared in at least this fraction of the stream.
    pub support: f64,
    /// Estimation slack; must lie in `(0, support)`.
    pub error_tolerance: f64,
    /// Sticky sampler only.
    pub failure_prob: f64,
    /// Default query threshold.
    pub threshold: f64,
    /// Report plain `count/N` instead of `count/N + support`.
    pub unbiased_frequency: bool,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            counter_type: CounterType::LossyCount,
            support: 0.01,
            error_tolerance: 0.001,
            failure_prob: 0.01,
            threshold: 0.01,
            unbiased_frequency: false,
        }
    }
}

impl CounterConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    ///
    /// - `WHARF_COUNTER_TYPE`: `LossyCount` or `StickySamplerT`
    /// - `WHARF_COUNTER_SUPPORT`
    /// - `WHARF_COUNTER_ERROR_TOLERANCE`
    /// - `WHARF_COUNTER_FAILURE_PROB`
    /// - `WHARF_COUNTER_THRESHOLD`
    /// - `WHARF_COUNTER_UNBIASED`
    pub fn from_env() -> Result<Self, CounterError> {
        let mut config = Self::default();
        if let Ok(kind) = std::env::var("WHARF_COUNTER_TYPE") {
            config.counter_type = kind.parse()?;
        }
        if let Some(support) = env_f64("WHARF_COUNTER_SUPPORT") {
            config.support = support;
        }
        if let Some(tolerance) = env_f64("WHARF_COUNTER_ERROR_TOLERANCE") {
            config.error_tolerance = tolerance;
        }
        if let Some(prob) = env_f64("WHARF_COUNTER_FAILURE_PROB") {
            config.failure_prob = prob;
        }
        if let Some(threshold) = env_f64("WHARF_COUNTER_THRESHOLD") {
            config.threshold = threshold;
        }
        if let Ok(unbiased) = std::env::var("WHARF_COUNTER_UNBIASED") {
            config.unbiased_frequency = unbiased.parse().unwrap_or(false);
        }
        Ok(config)
    }

    /// How queries through this config report frequencies.
    pub fn report_bias(&self) -> ReportBias {
        if self.unbiased_frequency {
            ReportBias::Unbiased
        } else {
            ReportBias::SupportBiased
        }
    }

    /// Build a named counter from these parameters.
    pub fn build(&self, name: &str) -> Result<FrequencyCounter, CounterError> {
        let counter = match self.counter_type {
            CounterType::LossyCount => {
                Counter::Lossy(LossyCounter::new(self.support, self.error_tolerance)?)
            }
            CounterType::StickySampler => Counter::Sticky(StickySampler::new(
                self.support,
                self.error_tolerance,
                self.failure_prob,
            )?),
        };
        Ok(FrequencyCounter {
            name: name.to_string(),
            counter,
        })
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// A named frequency counter, persistable as a schema-tagged document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyCounter {
    #[serde(rename = "Name")]
    name: String,
    #[serde(flatten)]
    counter: Counter,
}

impl FrequencyCounter {
    /// Name of the stream this counter watches.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one sample.
    pub fn observe(&mut self, key: &str) {
        self.counter.observe(key);
    }

    /// Keys whose estimated frequency clears `threshold`.
    pub fn items_above_threshold(&self, threshold: f64, bias: ReportBias) -> Vec<Entry> {
        self.counter.items_above_threshold(threshold, bias)
    }

    /// Serialize to the persisted document format.
    pub fn to_json(&self) -> Result<String, CounterError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rehydrate from a persisted document, dispatching on its
    /// `CounterType` tag.
    pub fn from_json(document: &str) -> Result<Self, CounterError> {
        Ok(serde_json::from_str(document)?)
    }
}
