//! # Benchmark Aggregation
//!
//! Reduces raw samples to the single throughput figure a benchmark reports.
//!
//! Two policies exist:
//!
//! - **Mean with fee correction** ([`finalize`]): the arithmetic mean of all
//!   samples, scaled down by the backend's dev fee. No samples means zero.
//! - **Tiered** ([`finalize_tiered`]): the long-window mean when it is
//!   positive, otherwise the short-window mean, otherwise no update at all.
//!
//! [`BenchmarkSession`] holds the lines gathered during one run and the
//! result, which can be written exactly once.

use crate::parser::WindowSamples;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Arithmetic mean, defined as zero for an empty slice
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// `mean(samples) * (1 - dev_fee_percent / 100)`
pub fn finalize(samples: &[f64], dev_fee_percent: f64) -> f64 {
    mean(samples) * (1.0 - dev_fee_percent * 0.01)
}

/// Prefer the long window; fall back to the short one only when the long
/// window produced nothing usable
///
/// `None` means "leave the previously recorded result alone". It is distinct
/// from `Some(0.0)`.
pub fn finalize_tiered(long: &[f64], short: &[f64]) -> Option<f64> {
    let long_mean = mean(long);
    if !long.is_empty() && long_mean > 0.0 {
        Some(long_mean)
    } else if !short.is_empty() {
        Some(mean(short))
    } else {
        None
    }
}

/// Which reduction a backend applies to its parsed output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Mean of all samples with the dev fee subtracted
    FeeCorrectedMean { dev_fee_percent: f64 },
    /// Long-window mean, else short-window mean, else unchanged
    Tiered,
}

/// Apply `policy` to `samples`
///
/// `None` only for a tiered policy whose windows were both empty.
pub fn aggregate(policy: AggregationPolicy, samples: &ParsedSamples) -> Option<f64> {
    match (policy, samples) {
        (AggregationPolicy::FeeCorrectedMean { dev_fee_percent }, ParsedSamples::Single(s)) => {
            Some(finalize(s, dev_fee_percent))
        }
        (AggregationPolicy::FeeCorrectedMean { dev_fee_percent }, ParsedSamples::Windows(w)) => {
            let all: Vec<f64> = w.long.iter().chain(w.short.iter()).copied().collect();
            Some(finalize(&all, dev_fee_percent))
        }
        (AggregationPolicy::Tiered, ParsedSamples::Windows(w)) => finalize_tiered(&w.long, &w.short),
        (AggregationPolicy::Tiered, ParsedSamples::Single(s)) => finalize_tiered(s, &[]),
    }
}

/// Samples produced by a backend's parser, shaped for its aggregation policy
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedSamples {
    Single(Vec<f64>),
    Windows(WindowSamples),
}

impl ParsedSamples {
    pub fn len(&self) -> usize {
        match self {
            ParsedSamples::Single(s) => s.len(),
            ParsedSamples::Windows(w) => w.short.len() + w.long.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of writing into an already finalized session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlreadyFinalized(pub f64);

/// One benchmark run: target duration, raw lines, write-once result
#[derive(Debug, Clone)]
pub struct BenchmarkSession {
    algorithm: String,
    duration: Duration,
    lines: Vec<String>,
    result: Option<f64>,
    updated: bool,
    sample_count: usize,
}

impl BenchmarkSession {
    pub fn new(algorithm: impl Into<String>, duration: Duration) -> Self {
        Self {
            algorithm: algorithm.into(),
            duration,
            lines: Vec::new(),
            result: None,
            updated: false,
            sample_count: 0,
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Append captured output in arrival order; ignored once finalized
    pub fn push_lines<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        if self.result.is_none() {
            self.lines.extend(lines);
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn result(&self) -> Option<f64> {
        self.result
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// False when finalization kept the previous value (tiered no-op)
    pub fn is_update(&self) -> bool {
        self.updated
    }

    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }

    /// Apply `policy` to `samples` and record the outcome
    ///
    /// `previous` is the value a tiered policy falls back to when neither
    /// window produced samples. Returns the recorded value.
    pub fn finalize(
        &mut self,
        samples: &ParsedSamples,
        policy: AggregationPolicy,
        previous: f64,
    ) -> Result<f64, AlreadyFinalized> {
        if let Some(result) = self.result {
            return Err(AlreadyFinalized(result));
        }
        let computed = aggregate(policy, samples);
        let value = computed.unwrap_or(previous);
        self.updated = computed.is_some();
        self.sample_count = samples.len();
        self.result = Some(value);
        Ok(value)
    }
}
