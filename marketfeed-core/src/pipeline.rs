//! Pipeline orchestration
//!
//! One ingestion loop (stream source, normalizer, aggregator, fan-out) plus
//! a periodic snapshot printer and an optional statistics exporter. All three
//! stop on the shared cancellation token; shutdown then closes every sink
//! once and emits a final snapshot and export.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{ConfigError, PipelineConfig};
use crate::exchanges::{Backoff, FeedError, StreamSource, StreamStats, Transport};
use crate::market_data::{MarketDataNormalizer, NormalizeError, OkxNormalizer};
use crate::metrics::{ReportError, RollingMetrics, StatsReportWriter};
use crate::sinks::{SinkFanout, SinkStats};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Stream setup failed: {0}")]
    Feed(#[from] FeedError),

    #[error("Fatal invariant violation: {0}")]
    Invariant(#[from] NormalizeError),
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub events_processed: u64,
    pub stream: StreamStats,
    pub sinks: Vec<SinkStats>,
}

pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    normalizer: Arc<dyn MarketDataNormalizer>,
    metrics: Arc<Mutex<RollingMetrics>>,
    fanout: SinkFanout,
    stop: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        fanout: SinkFanout,
        stop: CancellationToken,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let metrics = RollingMetrics::new(config.metrics.clone(), clock.clone());
        Ok(Self {
            normalizer: Arc::new(OkxNormalizer::new(clock.clone())),
            metrics: Arc::new(Mutex::new(metrics)),
            config,
            clock,
            transport,
            fanout,
            stop,
        })
    }

    pub fn metrics(&self) -> Arc<Mutex<RollingMetrics>> {
        self.metrics.clone()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until stopped or a fatal error occurs. Shutdown work runs in both
    /// cases; a fatal error is returned afterwards.
    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        let mut source = StreamSource::new(
            self.transport.clone(),
            self.clock.clone(),
            &self.config.stream.symbols,
            &self.config.stream.channels,
            Backoff::new(self.config.backoff.clone()),
            self.stop.clone(),
        )?;

        let report_writer = self
            .config
            .metrics
            .csv_export_path
            .clone()
            .map(StatsReportWriter::new);

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        tasks.push(tokio::spawn(snapshot_printer(
            self.metrics.clone(),
            self.stop.clone(),
            Duration::from_millis(self.config.metrics.snapshot_interval_ms),
        )));
        if let Some(writer) = report_writer.clone() {
            tasks.push(tokio::spawn(stats_exporter(
                self.metrics.clone(),
                writer,
                self.stop.clone(),
                Duration::from_millis(self.config.metrics.csv_export_interval_ms),
            )));
        }

        info!(exchange = self.normalizer.exchange_name(), "Ingesting");
        let outcome = self.ingest(&mut source).await;
        if let Err(e) = &outcome {
            error!(error = %e, "Error in stream processing, shutting down");
        }

        self.stop.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Periodic task ended abnormally");
            }
        }

        let close_failures = self.fanout.close_all().await;
        if close_failures > 0 {
            warn!(close_failures, "Some sinks failed to close");
        }

        let final_snapshot = self.metrics.lock().snapshot(true);
        if let Some(snapshot) = final_snapshot.filter(|s| !s.is_empty()) {
            info!(target: "metrics", "{}", snapshot);
        }
        if let Some(writer) = &report_writer {
            match export_once(&self.metrics, writer).await {
                Ok(rows) => info!(path = %writer.path().display(), rows, "Final metrics exported"),
                Err(e) => error!(error = %e, "Error in final CSV export"),
            }
        }

        let events_processed = self.metrics.lock().total_events();
        info!(events_processed, "Shutdown complete");

        outcome.map(|()| PipelineReport {
            events_processed,
            stream: source.stats().clone(),
            sinks: self.fanout.stats(),
        })
    }

    async fn ingest(&mut self, source: &mut StreamSource) -> Result<(), PipelineError> {
        while let Some(frame) = source.next_frame().await {
            let events = self.normalizer.normalize(&frame)?;
            for event in &events {
                self.metrics.lock().update(event);
                self.fanout.dispatch(event).await;
            }
        }
        Ok(())
    }
}

async fn snapshot_printer(
    metrics: Arc<Mutex<RollingMetrics>>,
    stop: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.lock().snapshot(false);
                if let Some(snapshot) = snapshot.filter(|s| !s.is_empty()) {
                    info!(target: "metrics", "{}", snapshot);
                }
            }
        }
    }
}

async fn stats_exporter(
    metrics: Arc<Mutex<RollingMetrics>>,
    writer: StatsReportWriter,
    stop: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match export_once(&metrics, &writer).await {
                    Ok(rows) => info!(path = %writer.path().display(), rows, "Exported metrics"),
                    Err(e) => error!(error = %e, "Error exporting CSV"),
                }
            }
        }
    }
}

/// Snapshot the per-key statistics and write them off the async runtime.
async fn export_once(
    metrics: &Mutex<RollingMetrics>,
    writer: &StatsReportWriter,
) -> Result<usize, ReportError> {
    let rows = metrics.lock().export_stats(Utc::now());
    let count = rows.len();
    let writer = writer.clone();
    tokio::task::spawn_blocking(move || writer.write(&rows))
        .await
        .map_err(|e| ReportError::Task(e.to_string()))??;
    Ok(count)
}
