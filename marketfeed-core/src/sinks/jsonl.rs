//! Partitioned JSON-lines file sink

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{EventSink, SinkError, SinkResult, SinksConfig};
use crate::exchanges::CanonicalEvent;

/// `root/{exchange}/{channel}/{YYYY-MM-DD}/{symbol}.jsonl`, dated by the UTC
/// day of the wall-clock receipt time.
pub fn partition_path(
    root: &Path,
    exchange: &str,
    channel: &str,
    symbol: &str,
    recv_epoch_ms: i64,
) -> PathBuf {
    let day = Utc
        .timestamp_millis_opt(recv_epoch_ms)
        .single()
        .map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    root.join(exchange)
        .join(channel)
        .join(day)
        .join(format!("{}.jsonl", symbol))
}

/// Lines waiting to be appended to one partition file. The entry outlives
/// its flushes so `last_flush` keeps counting across idle periods.
struct PartitionBuffer {
    lines: String,
    pending: usize,
    last_flush: Instant,
}

impl PartitionBuffer {
    fn due(&self, interval: Duration) -> bool {
        self.pending > 0 && self.last_flush.elapsed() >= interval
    }
}

/// Buffers events per partition and appends them in batches.
///
/// A partition is flushed once it holds `flush_count` events or its last
/// flush is `flush_interval` ago; every write also sweeps other partitions
/// past the interval. A batch whose append fails is dropped.
pub struct JsonlSink {
    root: PathBuf,
    flush_count: usize,
    flush_interval: Duration,
    partitions: HashMap<PathBuf, PartitionBuffer>,
    closed: bool,
}

impl JsonlSink {
    pub fn new(root: impl Into<PathBuf>, flush_count: usize, flush_interval: Duration) -> Self {
        Self {
            root: root.into(),
            flush_count: flush_count.max(1),
            flush_interval,
            partitions: HashMap::new(),
            closed: false,
        }
    }

    pub fn from_config(config: &SinksConfig) -> Self {
        Self::new(
            config.data_root.clone(),
            config.jsonl_flush_count,
            Duration::from_millis(config.jsonl_flush_interval_ms),
        )
    }

    /// Events buffered and not yet written.
    pub fn pending(&self) -> usize {
        self.partitions.values().map(|p| p.pending).sum()
    }

    async fn flush_partition(&mut self, path: &Path) -> SinkResult<()> {
        let Some(buffer) = self.partitions.get_mut(path) else {
            return Ok(());
        };
        if buffer.pending == 0 {
            return Ok(());
        }
        let lines = std::mem::take(&mut buffer.lines);
        let events = std::mem::replace(&mut buffer.pending, 0);
        buffer.last_flush = Instant::now();

        append(path, lines.as_bytes()).await?;
        debug!(path = %path.display(), events, "Flushed partition");
        Ok(())
    }

    /// Flush every partition; the first error is returned after all were tried.
    async fn flush_where(&mut self, due: impl Fn(&PartitionBuffer) -> bool) -> SinkResult<()> {
        let paths: Vec<PathBuf> = self
            .partitions
            .iter()
            .filter(|(_, buffer)| due(buffer))
            .map(|(path, _)| path.clone())
            .collect();

        let mut first_error = None;
        for path in paths {
            if let Err(e) = self.flush_partition(&path).await {
                warn!(path = %path.display(), error = %e, "Dropping unflushed partition batch");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> SinkResult<()> {
    let io_err = |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&mut self, event: &CanonicalEvent) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed(self.name().to_string()));
        }

        let path = partition_path(
            &self.root,
            &event.exchange,
            &event.channel,
            &event.symbol,
            event.ts_recv_epoch_ms,
        );
        let line = serde_json::to_string(event)?;

        let buffer = self
            .partitions
            .entry(path.clone())
            .or_insert_with(|| PartitionBuffer {
                lines: String::new(),
                pending: 0,
                last_flush: Instant::now(),
            });
        buffer.lines.push_str(&line);
        buffer.lines.push('\n');
        buffer.pending += 1;

        let interval = self.flush_interval;
        let result = if buffer.pending >= self.flush_count || buffer.due(interval) {
            self.flush_partition(&path).await
        } else {
            Ok(())
        };
        let swept = self
            .flush_where(|buffer| buffer.due(interval))
            .await;
        result.and(swept)
    }

    async fn close(&mut self) -> SinkResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_where(|buffer| buffer.pending > 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{BookLevel, BookSnapshot, Payload, TradePrint};
    use tempfile::TempDir;

    // 2024-03-01T23:59:59.900Z
    const LATE_MS: i64 = 1_709_337_599_900;

    fn trade(symbol: &str, recv_epoch_ms: i64) -> CanonicalEvent {
        CanonicalEvent {
            exchange: "okx".to_string(),
            symbol: symbol.to_string(),
            channel: "trades".to_string(),
            event_type: "trade".to_string(),
            ts_exchange_ms: recv_epoch_ms - 10,
            ts_recv_epoch_ms: recv_epoch_ms,
            ts_recv_mono_ns: 10,
            ts_decoded_mono_ns: 20,
            ts_proc_mono_ns: 30,
            payload: Payload::Trade(TradePrint {
                price: 100.0,
                size: 0.5,
                side: "buy".to_string(),
                trade_id: Some("9".to_string()),
            }),
        }
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_partition_path_uses_utc_receipt_day() {
        let root = Path::new("data");
        assert_eq!(
            partition_path(root, "okx", "books5", "BTC-USDT", LATE_MS),
            PathBuf::from("data/okx/books5/2024-03-01/BTC-USDT.jsonl")
        );
        assert_eq!(
            partition_path(root, "okx", "books5", "BTC-USDT", LATE_MS + 100),
            PathBuf::from("data/okx/books5/2024-03-02/BTC-USDT.jsonl")
        );
    }

    #[tokio::test]
    async fn test_flushes_on_count() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path(), 3, Duration::from_secs(3600));
        let path = partition_path(dir.path(), "okx", "trades", "BTC-USDT", LATE_MS);

        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();
        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();
        assert!(!path.exists());
        assert_eq!(sink.pending(), 2);

        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();
        assert_eq!(read_lines(&path).len(), 3);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval_and_sweeps_idle_partitions() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path(), 100, Duration::from_secs(1));
        let eth = partition_path(dir.path(), "okx", "trades", "ETH-USDT", LATE_MS);
        let btc = partition_path(dir.path(), "okx", "trades", "BTC-USDT", LATE_MS);

        sink.write(&trade("ETH-USDT", LATE_MS)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_100)).await;
        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();

        assert_eq!(read_lines(&eth).len(), 1);
        assert!(!btc.exists());
        assert_eq!(sink.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_partition_flushes_on_next_write() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path(), 100, Duration::from_secs(1));
        let btc = partition_path(dir.path(), "okx", "trades", "BTC-USDT", LATE_MS);

        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_100)).await;
        sink.write(&trade("ETH-USDT", LATE_MS)).await.unwrap();
        assert_eq!(read_lines(&btc).len(), 1);

        // BTC last flushed 5s ago, so its next event goes straight out.
        tokio::time::advance(Duration::from_secs(5)).await;
        sink.write(&trade("BTC-USDT", LATE_MS)).await.unwrap();
        assert_eq!(read_lines(&btc).len(), 2);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_later_writes() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path(), 100, Duration::from_secs(3600));

        let mut book = trade("BTC-USDT", LATE_MS);
        book.channel = "books5".to_string();
        book.event_type = "book_topn".to_string();
        book.payload = Payload::Book(BookSnapshot::from_levels(
            5,
            vec![BookLevel::new(100.0, 1.0, 2)],
            vec![BookLevel::new(101.0, 2.0, 3)],
        ));
        sink.write(&book).await.unwrap();
        sink.write(&trade("BTC-USDT", LATE_MS + 100)).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        let books = read_lines(&partition_path(dir.path(), "okx", "books5", "BTC-USDT", LATE_MS));
        assert_eq!(books.len(), 1);
        assert_eq!(books[0]["payload"]["best_ask"], 101.0);
        assert_eq!(books[0]["payload"]["bids"], serde_json::json!([[100.0, 1.0, 2]]));
        assert_eq!(books[0]["ts_recv_epoch_ms"], LATE_MS);

        let next_day = read_lines(&partition_path(
            dir.path(),
            "okx",
            "trades",
            "BTC-USDT",
            LATE_MS + 100,
        ));
        assert_eq!(next_day[0]["payload"]["trade_id"], "9");

        assert!(matches!(
            sink.write(&trade("BTC-USDT", LATE_MS)).await,
            Err(SinkError::Closed(_))
        ));
    }
}
