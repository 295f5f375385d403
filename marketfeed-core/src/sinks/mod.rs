//! Event sinks and fan-out delivery
//!
//! Every registered sink receives every event in normalizer order. A failing
//! sink is logged and counted; it never blocks the other sinks or ingestion.

pub mod jsonl;
pub mod stdout;

pub use jsonl::JsonlSink;
pub use stdout::StdoutSink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error};

use crate::exchanges::CanonicalEvent;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sink {0} is closed")]
    Closed(String),

    #[error("{0}")]
    Other(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Output destination for canonical events.
#[async_trait]
pub trait EventSink: Send {
    fn name(&self) -> &str;

    async fn write(&mut self, event: &CanonicalEvent) -> SinkResult<()>;

    /// Flush anything buffered and release resources.
    async fn close(&mut self) -> SinkResult<()>;
}

/// Sink selection and file sink tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub stdout: bool,
    pub jsonl: bool,
    pub data_root: PathBuf,
    pub jsonl_flush_count: usize,
    pub jsonl_flush_interval_ms: u64,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            jsonl: true,
            data_root: PathBuf::from("data"),
            jsonl_flush_count: 100,
            jsonl_flush_interval_ms: 1_000,
        }
    }
}

/// Per-sink delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
    pub close_failed: bool,
}

struct RegisteredSink {
    sink: Box<dyn EventSink>,
    stats: SinkStats,
}

/// Ordered set of independently failing sinks.
#[derive(Default)]
pub struct SinkFanout {
    sinks: Vec<RegisteredSink>,
    closed: bool,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Box<dyn EventSink>) {
        let stats = SinkStats {
            name: sink.name().to_string(),
            ..SinkStats::default()
        };
        self.sinks.push(RegisteredSink { sink, stats });
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deliver one event to every sink. Returns how many sinks failed.
    pub async fn dispatch(&mut self, event: &CanonicalEvent) -> usize {
        let mut failures = 0;
        for entry in &mut self.sinks {
            match entry.sink.write(event).await {
                Ok(()) => entry.stats.delivered += 1,
                Err(e) => {
                    entry.stats.failed += 1;
                    failures += 1;
                    error!(
                        sink = %entry.stats.name,
                        symbol = %event.symbol,
                        error = %e,
                        "Error writing to sink"
                    );
                }
            }
        }
        failures
    }

    /// Close every sink exactly once; later calls are no-ops. Returns how
    /// many sinks failed to close.
    pub async fn close_all(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;

        let mut failures = 0;
        for entry in &mut self.sinks {
            match entry.sink.close().await {
                Ok(()) => debug!(sink = %entry.stats.name, "Sink closed"),
                Err(e) => {
                    entry.stats.close_failed = true;
                    failures += 1;
                    error!(sink = %entry.stats.name, error = %e, "Error closing sink");
                }
            }
        }
        failures
    }

    pub fn stats(&self) -> Vec<SinkStats> {
        self.sinks.iter().map(|s| s.stats.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{BookSnapshot, Payload};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records events; optionally fails every write and close.
    struct RecordingSink {
        name: String,
        fail: bool,
        seen: Arc<Mutex<Vec<i64>>>,
        closes: Arc<Mutex<u32>>,
    }

    impl RecordingSink {
        fn new(name: &str, fail: bool) -> (Self, Arc<Mutex<Vec<i64>>>, Arc<Mutex<u32>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let closes = Arc::new(Mutex::new(0));
            let sink = Self {
                name: name.to_string(),
                fail,
                seen: seen.clone(),
                closes: closes.clone(),
            };
            (sink, seen, closes)
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&mut self, event: &CanonicalEvent) -> SinkResult<()> {
            if self.fail {
                return Err(SinkError::Other("disk on fire".to_string()));
            }
            self.seen.lock().push(event.ts_exchange_ms);
            Ok(())
        }

        async fn close(&mut self) -> SinkResult<()> {
            *self.closes.lock() += 1;
            if self.fail {
                return Err(SinkError::Other("close failed".to_string()));
            }
            Ok(())
        }
    }

    fn event(ts: i64) -> CanonicalEvent {
        CanonicalEvent {
            exchange: "okx".to_string(),
            symbol: "BTC-USDT".to_string(),
            channel: "books5".to_string(),
            event_type: "book_topn".to_string(),
            ts_exchange_ms: ts,
            ts_recv_epoch_ms: ts + 5,
            ts_recv_mono_ns: 1,
            ts_decoded_mono_ns: 2,
            ts_proc_mono_ns: 3,
            payload: Payload::Book(BookSnapshot::from_levels(5, vec![], vec![])),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_starve_others() {
        let (failing, _, failing_closes) = RecordingSink::new("failing", true);
        let (healthy, seen, healthy_closes) = RecordingSink::new("healthy", false);

        let mut fanout = SinkFanout::new();
        fanout.register(Box::new(failing));
        fanout.register(Box::new(healthy));

        for ts in 0..10 {
            assert_eq!(fanout.dispatch(&event(ts)).await, 1);
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

        let stats = fanout.stats();
        assert_eq!(stats[0].name, "failing");
        assert_eq!((stats[0].delivered, stats[0].failed), (0, 10));
        assert_eq!((stats[1].delivered, stats[1].failed), (10, 0));

        assert_eq!(fanout.close_all().await, 1);
        assert_eq!(*failing_closes.lock(), 1);
        assert_eq!(*healthy_closes.lock(), 1);
        assert!(fanout.stats()[0].close_failed);
    }

    #[tokio::test]
    async fn test_close_all_runs_once() {
        let (sink, _, closes) = RecordingSink::new("once", false);
        let mut fanout = SinkFanout::new();
        fanout.register(Box::new(sink));

        assert_eq!(fanout.close_all().await, 0);
        assert_eq!(fanout.close_all().await, 0);
        assert!(fanout.is_closed());
        assert_eq!(*closes.lock(), 1);
    }
}
