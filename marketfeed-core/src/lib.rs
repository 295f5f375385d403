//! Latency-instrumented market data pipeline
//!
//! Ingests a public exchange WebSocket feed, normalizes frames into canonical
//! events stamped at every stage, aggregates stage latencies over a rolling
//! window and fans events out to independent sinks.

pub mod clock;
pub mod config;
pub mod exchanges;
pub mod market_data;
pub mod metrics;
pub mod pipeline;
pub mod sinks;

// Re-export main types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PipelineConfig};
pub use exchanges::{
    CanonicalEvent, FeedError, Payload, RawFrame, StreamSource, Transport, TungsteniteTransport,
};
pub use market_data::{MarketDataNormalizer, NormalizeError, OkxNormalizer};
pub use metrics::{LatencySnapshot, RollingMetrics, StatsReportWriter};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
pub use sinks::{EventSink, JsonlSink, SinkFanout, StdoutSink};
