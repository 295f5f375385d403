//! Market Data Recorder
//!
//! Streams OKX public market data, records normalized events and reports
//! rolling stage latencies until interrupted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use marketfeed_core::config::parse_list;
use marketfeed_core::sinks::{JsonlSink, SinkFanout, StdoutSink};
use marketfeed_core::{Pipeline, PipelineConfig, SystemClock, TungsteniteTransport};

/// OKX WebSocket market data pipeline
#[derive(Debug, Parser)]
#[command(name = "marketfeed-recorder", version, about)]
struct Args {
    /// Comma-separated list of trading pairs
    #[arg(long, env = "MARKETFEED_SYMBOLS")]
    symbols: Option<String>,

    /// Comma-separated list of channels (e.g. books5,trades)
    #[arg(long, env = "MARKETFEED_CHANNELS")]
    channels: Option<String>,

    /// WebSocket URL
    #[arg(long)]
    url: Option<String>,

    /// Path of the CSV statistics report (e.g. reports/metrics_summary.csv)
    #[arg(long)]
    csv_export: Option<PathBuf>,

    /// CSV export interval in seconds
    #[arg(long)]
    csv_export_interval: Option<f64>,

    /// Disable the stdout sink
    #[arg(long)]
    no_stdout: bool,

    /// Disable the JSONL file sink
    #[arg(long)]
    no_jsonl: bool,

    /// Root directory for JSONL partitions
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(raw) = &self.symbols {
            config.stream.symbols = parse_list(raw);
        }
        if let Some(raw) = &self.channels {
            config.stream.channels = parse_list(raw);
        }
        if let Some(url) = self.url {
            config.stream.url = url;
        }
        if let Some(path) = self.csv_export {
            config.metrics.csv_export_path = Some(path);
        }
        if let Some(seconds) = self.csv_export_interval {
            if !(seconds.is_finite() && seconds > 0.0) {
                bail!("--csv-export-interval must be a positive number of seconds");
            }
            config.metrics.csv_export_interval_ms = (seconds * 1000.0).round().max(1.0) as u64;
        }
        if self.no_stdout {
            config.sinks.stdout = false;
        }
        if self.no_jsonl {
            config.sinks.jsonl = false;
        }
        if let Some(root) = self.data_root {
            config.sinks.data_root = root;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `stop` on Ctrl+C or SIGTERM.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("🛑 Received shutdown signal, stopping...");
        stop.cancel();
    });
}

fn build_sinks(config: &PipelineConfig) -> SinkFanout {
    let mut fanout = SinkFanout::new();
    if config.sinks.stdout {
        fanout.register(Box::new(StdoutSink::new()));
    }
    if config.sinks.jsonl {
        fanout.register(Box::new(JsonlSink::from_config(&config.sinks)));
    }
    fanout
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        symbols = ?config.stream.symbols,
        channels = ?config.stream.channels,
        url = %config.stream.url,
        "🚀 Starting pipeline"
    );
    info!(stdout = config.sinks.stdout, jsonl = config.sinks.jsonl, "Sinks");
    if let Some(path) = &config.metrics.csv_export_path {
        info!(
            path = %path.display(),
            interval_ms = config.metrics.csv_export_interval_ms,
            "CSV export"
        );
    }

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    let fanout = build_sinks(&config);
    let transport = Arc::new(TungsteniteTransport::new(config.stream.clone()));
    let pipeline = Pipeline::new(
        config,
        transport,
        Arc::new(SystemClock::new()),
        fanout,
        stop,
    )
    .context("Failed to build pipeline")?;

    match pipeline.run().await {
        Ok(report) => {
            info!(events = report.events_processed, "✅ Pipeline stopped");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            std::process::exit(1);
        }
    }
}
