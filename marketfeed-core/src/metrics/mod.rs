//! Latency metrics: rolling windows, aggregation and statistics export

pub mod aggregator;
pub mod report;
pub mod rolling;

pub use aggregator::{KeyStatsRow, LatencySnapshot, MetricsConfig, RollingMetrics};
pub use report::{ReportError, StatsReportWriter};
pub use rolling::{Percentiles, RollingWindow, Sample, SeriesStats};
