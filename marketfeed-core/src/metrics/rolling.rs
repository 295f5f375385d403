//! Time-bounded sample windows and summary statistics

use serde::Serialize;
use std::collections::VecDeque;

/// One observation keyed by the aggregator's monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at_ms: u64,
    pub value: f64,
}

/// Nearest-rank percentiles of one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Sliding window of samples ordered by arrival time.
///
/// Bounded by duration only. Arrival timestamps are non-decreasing, so
/// eviction pops from the front and stops at the first live sample.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window_ms: u64,
    samples: VecDeque<Sample>,
}

impl RollingWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    /// Append a sample and evict everything that fell out of the window.
    pub fn push(&mut self, at_ms: u64, value: f64) {
        self.samples.push_back(Sample { at_ms, value });
        self.evict(at_ms);
    }

    /// Drop samples older than `now_ms - window`.
    pub fn evict(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some(front) = self.samples.front() {
            if front.at_ms >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// p50/p95/p99, withheld while fewer than `min_samples` are held.
    pub fn percentiles(&self, min_samples: usize) -> Option<Percentiles> {
        if self.samples.is_empty() || self.samples.len() < min_samples {
            return None;
        }
        let mut sorted = self.values();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(Percentiles {
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        })
    }

    pub fn stats(&self) -> SeriesStats {
        SeriesStats::from_values(&self.values())
    }
}

/// `sorted[floor(p/100 * (n-1))]`; `sorted` must be non-empty.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let idx = ((p / 100.0) * (n - 1) as f64).floor() as usize;
    sorted[idx.min(n - 1)]
}

/// Count, mean, sample standard deviation, min and max of a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SeriesStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl SeriesStats {
    pub fn from_values(values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self::default();
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (count - 1) as f64).sqrt()
        } else {
            0.0
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            count,
            mean,
            std,
            min,
            max,
        }
    }
}
