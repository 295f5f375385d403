//! CSV statistics report

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::aggregator::KeyStatsRow;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error writing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Report task failed: {0}")]
    Task(String),
}

pub const REPORT_HEADER: [&str; 13] = [
    "generated_at_utc",
    "symbol",
    "channel",
    "lat_count",
    "lat_mean_ms",
    "lat_std_ms",
    "lat_min_ms",
    "lat_max_ms",
    "stale_count",
    "stale_mean_ms",
    "stale_std_ms",
    "stale_min_ms",
    "stale_max_ms",
];

/// Rewrites the statistics report file on every export.
#[derive(Debug, Clone)]
pub struct StatsReportWriter {
    path: PathBuf,
}

impl StatsReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the report with `rows`. The new content is written to a
    /// sibling temp file first so readers never see a partial report.
    pub fn write(&self, rows: &[KeyStatsRow]) -> Result<(), ReportError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ReportError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        self.write_csv(&tmp_path, rows)?;

        fs::rename(&tmp_path, &self.path).map_err(|source| ReportError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn write_csv(&self, path: &Path, rows: &[KeyStatsRow]) -> Result<(), ReportError> {
        let csv_err = |source| ReportError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        writer.write_record(REPORT_HEADER).map_err(csv_err)?;
        for row in rows {
            writer.write_record(record(row)).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn record(row: &KeyStatsRow) -> [String; 13] {
    let lat = &row.latency;
    let stale = &row.staleness;
    [
        row.generated_at_utc.clone(),
        row.symbol.clone(),
        row.channel.clone(),
        lat.count.to_string(),
        format!("{:.3}", lat.mean),
        format!("{:.3}", lat.std),
        format!("{:.3}", lat.min),
        format!("{:.3}", lat.max),
        stale.count.to_string(),
        format!("{:.3}", stale.mean),
        format!("{:.3}", stale.std),
        format!("{:.3}", stale.min),
        format!("{:.3}", stale.max),
    ]
}
