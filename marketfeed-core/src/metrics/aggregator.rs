//! Rolling latency and staleness aggregation

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::rolling::{Percentiles, RollingWindow, SeriesStats};
use crate::clock::Clock;
use crate::exchanges::CanonicalEvent;

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Rolling window length
    pub window_ms: u64,
    /// Percentiles are withheld for series holding fewer samples
    pub min_samples: usize,
    /// Minimum spacing between unforced snapshots
    pub snapshot_interval_ms: u64,
    /// Statistics report destination; export disabled when unset
    pub csv_export_path: Option<PathBuf>,
    pub csv_export_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            min_samples: 20,
            snapshot_interval_ms: 1_000,
            csv_export_path: None,
            csv_export_interval_ms: 30_000,
        }
    }
}

/// Series tracked per (symbol, channel)
#[derive(Debug, Clone)]
struct KeySeries {
    latency: RollingWindow,
    staleness: RollingWindow,
    last_ts_exchange_ms: Option<i64>,
}

impl KeySeries {
    fn new(window_ms: u64) -> Self {
        Self {
            latency: RollingWindow::new(window_ms),
            staleness: RollingWindow::new(window_ms),
            last_ts_exchange_ms: None,
        }
    }
}

/// Point-in-time percentile summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    /// Exchange to receipt, milliseconds
    pub exchange_to_recv_ms: Option<Percentiles>,
    /// Receipt to decode, nanoseconds
    pub recv_to_decode_ns: Option<Percentiles>,
    /// Decode to processed, nanoseconds
    pub decode_to_proc_ns: Option<Percentiles>,
    pub zero_recv_to_decode_pct: f64,
    pub zero_decode_to_proc_pct: f64,
    pub message_counts: Vec<(String, u64)>,
}

impl LatencySnapshot {
    /// True when every series is still below the sample minimum.
    pub fn is_empty(&self) -> bool {
        self.exchange_to_recv_ms.is_none()
            && self.recv_to_decode_ns.is_none()
            && self.decode_to_proc_ns.is_none()
    }
}

impl fmt::Display for LatencySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(p) = &self.exchange_to_recv_ms {
            parts.push(format!(
                "Ex→Recv p50={:.1}ms p95={:.1}ms p99={:.1}ms",
                p.p50, p.p95, p.p99
            ));
        }
        if let Some(p) = &self.recv_to_decode_ns {
            parts.push(format!(
                "Recv→Decode p50={:.3}us p95={:.3}us p99={:.3}us (zero={:.1}%)",
                p.p50 / 1000.0,
                p.p95 / 1000.0,
                p.p99 / 1000.0,
                self.zero_recv_to_decode_pct
            ));
        }
        if let Some(p) = &self.decode_to_proc_ns {
            parts.push(format!(
                "Decode→Proc p50={:.3}us p95={:.3}us p99={:.3}us (zero={:.1}%)",
                p.p50 / 1000.0,
                p.p95 / 1000.0,
                p.p99 / 1000.0,
                self.zero_decode_to_proc_pct
            ));
        }
        let counts = self
            .message_counts
            .iter()
            .map(|(symbol, count)| format!("{}:{}", symbol, count))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "Metrics | {} | Msgs: {}", parts.join(" | "), counts)
    }
}

/// One statistics export row.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyStatsRow {
    pub generated_at_utc: String,
    pub symbol: String,
    pub channel: String,
    pub latency: SeriesStats,
    pub staleness: SeriesStats,
}

/// Rolling aggregator over canonical events.
///
/// Samples are keyed by this aggregator's own monotonic clock rather than
/// event timestamps. Memory is bounded by the window duration only: no count
/// cap is applied, so a burst of N events per window holds N samples per
/// series.
pub struct RollingMetrics {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    exchange_to_recv: RollingWindow,
    recv_to_decode: RollingWindow,
    decode_to_proc: RollingWindow,
    by_key: BTreeMap<(String, String), KeySeries>,
    message_counts: BTreeMap<String, u64>,
    zero_recv_to_decode: u64,
    zero_decode_to_proc: u64,
    total_events: u64,
    last_snapshot_ms: u64,
}

impl RollingMetrics {
    pub fn new(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let window_ms = config.window_ms;
        let last_snapshot_ms = clock.now_mono_ms();
        Self {
            config,
            clock,
            exchange_to_recv: RollingWindow::new(window_ms),
            recv_to_decode: RollingWindow::new(window_ms),
            decode_to_proc: RollingWindow::new(window_ms),
            by_key: BTreeMap::new(),
            message_counts: BTreeMap::new(),
            zero_recv_to_decode: 0,
            zero_decode_to_proc: 0,
            total_events: 0,
            last_snapshot_ms,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    pub fn message_count(&self, symbol: &str) -> u64 {
        self.message_counts.get(symbol).copied().unwrap_or(0)
    }

    pub fn update(&mut self, event: &CanonicalEvent) {
        let now_ms = self.clock.now_mono_ms();

        let ex_to_recv_ms = event.exchange_to_recv_ms() as f64;
        let recv_to_decode_ns = event.recv_to_decode_ns();
        let decode_to_proc_ns = event.decode_to_proc_ns();

        self.total_events += 1;
        if recv_to_decode_ns == 0 {
            self.zero_recv_to_decode += 1;
        }
        if decode_to_proc_ns == 0 {
            self.zero_decode_to_proc += 1;
        }

        self.exchange_to_recv.push(now_ms, ex_to_recv_ms);
        self.recv_to_decode.push(now_ms, recv_to_decode_ns as f64);
        self.decode_to_proc.push(now_ms, decode_to_proc_ns as f64);

        let window_ms = self.config.window_ms;
        let series = self
            .by_key
            .entry((event.symbol.clone(), event.channel.clone()))
            .or_insert_with(|| KeySeries::new(window_ms));
        series.latency.push(now_ms, ex_to_recv_ms);
        if let Some(last_ts) = series.last_ts_exchange_ms {
            series
                .staleness
                .push(now_ms, event.ts_exchange_ms.saturating_sub(last_ts) as f64);
        }
        series.last_ts_exchange_ms = Some(event.ts_exchange_ms);

        *self.message_counts.entry(event.symbol.clone()).or_insert(0) += 1;
    }

    /// Percentile summary, at most once per snapshot interval unless forced.
    pub fn snapshot(&mut self, force: bool) -> Option<LatencySnapshot> {
        let now_ms = self.clock.now_mono_ms();
        if !force && now_ms.saturating_sub(self.last_snapshot_ms) < self.config.snapshot_interval_ms {
            return None;
        }
        self.last_snapshot_ms = now_ms;

        self.exchange_to_recv.evict(now_ms);
        self.recv_to_decode.evict(now_ms);
        self.decode_to_proc.evict(now_ms);

        let min_samples = self.config.min_samples;
        let total = self.total_events.max(1) as f64;
        Some(LatencySnapshot {
            exchange_to_recv_ms: self.exchange_to_recv.percentiles(min_samples),
            recv_to_decode_ns: self.recv_to_decode.percentiles(min_samples),
            decode_to_proc_ns: self.decode_to_proc.percentiles(min_samples),
            zero_recv_to_decode_pct: self.zero_recv_to_decode as f64 / total * 100.0,
            zero_decode_to_proc_pct: self.zero_decode_to_proc as f64 / total * 100.0,
            message_counts: self
                .message_counts
                .iter()
                .map(|(symbol, count)| (symbol.clone(), *count))
                .collect(),
        })
    }

    /// Statistics for every key seen so far, as of now.
    pub fn export_stats(&mut self, generated_at: DateTime<Utc>) -> Vec<KeyStatsRow> {
        let now_ms = self.clock.now_mono_ms();
        let generated_at_utc = generated_at.to_rfc3339_opts(SecondsFormat::Micros, false);

        self.by_key
            .iter_mut()
            .map(|((symbol, channel), series)| {
                series.latency.evict(now_ms);
                series.staleness.evict(now_ms);
                KeyStatsRow {
                    generated_at_utc: generated_at_utc.clone(),
                    symbol: symbol.clone(),
                    channel: channel.clone(),
                    latency: series.latency.stats(),
                    staleness: series.staleness.stats(),
                }
            })
            .collect()
    }
}
