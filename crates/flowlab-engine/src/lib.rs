pub mod analysis;
pub mod collector;
pub mod error;
pub mod ports;
pub mod report;
pub mod scheduler;
pub mod sweep;

#[cfg(test)]
mod testkit;

pub use analysis::{
    AnalysisReport, BREAKING_POINT_THRESHOLD_PCT, BreakingPoint, PeakThroughput,
    ScalingEfficiency, TrendPoint, analyze, analyze_with_threshold,
};
pub use collector::{FlowTypeSummary, ResultsCollector, TestSummary};
pub use error::{EnvironmentPhase, RunError, SweepError};
pub use ports::PortPool;
pub use report::{
    ReportError, SweepReport, TestReport, export_sweep_csv, format_bits, format_bytes,
    load_sweep_report, save_sweep_report, save_test_report, sweep_csv,
};
pub use scheduler::{FlowScheduler, SchedulerConfig, TestRun, run_test};
pub use sweep::{ScenarioSweepRunner, SweepPoint, SweepResult, run_sweep};
