use crate::analysis::AnalysisReport;
use crate::collector::TestSummary;
use crate::scheduler::TestRun;
use crate::sweep::SweepResult;
use chrono::{DateTime, Local, Utc};
use flowlab_abstract::FlowResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed report {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub timestamp: DateTime<Utc>,
    pub profile_name: String,
    pub summary: TestSummary,
    pub flows: Vec<FlowResult>,
}

impl From<TestRun> for TestReport {
    fn from(run: TestRun) -> Self {
        Self {
            timestamp: Utc::now(),
            profile_name: run.profile_name,
            summary: run.summary,
            flows: run.flows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub timestamp: DateTime<Utc>,
    pub sweep: SweepResult,
    pub analysis: Option<AnalysisReport>,
}

impl SweepReport {
    pub fn new(sweep: SweepResult, analysis: Option<AnalysisReport>) -> Self {
        Self {
            timestamp: Utc::now(),
            sweep,
            analysis,
        }
    }
}

fn stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `report` into `dir` as `test_results_<stamp>.json`.
pub fn save_test_report(dir: &Path, report: &TestReport) -> Result<PathBuf, ReportError> {
    let path = dir.join(format!("test_results_{}.json", stamp()));
    write_json(&path, report)?;
    info!(path = %path.display(), "test report saved");
    Ok(path)
}

/// Write `report` into `dir` as `sweep_<name>_<stamp>.json`.
pub fn save_sweep_report(dir: &Path, report: &SweepReport) -> Result<PathBuf, ReportError> {
    let path = dir.join(format!(
        "sweep_{}_{}.json",
        file_safe(&report.sweep.name),
        stamp()
    ));
    write_json(&path, report)?;
    info!(path = %path.display(), points = report.sweep.points.len(), "sweep report saved");
    Ok(path)
}

pub fn load_sweep_report(path: &Path) -> Result<SweepReport, ReportError> {
    let raw = fs::read(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })
}

const CSV_HEADER: &str = "num_clients,total_flows,successful_flows,success_rate_pct,total_bytes,\
total_throughput_bps,per_client_throughput_bps,retransmits,packet_loss_pct,mice_flows,elephant_flows";

/// One row per sweep point, in sweep order.
pub fn sweep_csv(sweep: &SweepResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", csv_escape(&sweep.name)));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for point in &sweep.points {
        let s = &point.summary;
        out.push_str(&format!(
            "{},{},{},{:.2},{},{:.2},{:.2},{},{:.4},{},{}\n",
            point.client_count,
            s.total_flows,
            s.successful_flows,
            s.success_rate_pct,
            s.total_bytes,
            s.aggregate_throughput_bps,
            point.throughput_per_client_bps,
            s.total_retransmits,
            s.packet_loss_pct,
            s.mice_flows.total,
            s.elephant_flows.total,
        ));
    }
    out
}

pub fn export_sweep_csv(sweep: &SweepResult, path: &Path) -> Result<(), ReportError> {
    fs::write(path, sweep_csv(sweep)).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), rows = sweep.points.len(), "sweep exported as csv");
    Ok(())
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Human-readable byte count in binary units, e.g. `1.50 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Human-readable bit rate in decimal units, e.g. `25.00 Mbps`.
pub fn format_bits(bits_per_second: f64) -> String {
    const UNITS: [&str; 5] = ["bps", "Kbps", "Mbps", "Gbps", "Tbps"];
    let mut value = bits_per_second;
    let mut unit = 0;
    while value.abs() >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
