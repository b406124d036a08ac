use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use flowlab_abstract::{AbortSignal, NetworkEnvironment, Profile, Scenario};
use flowlab_backend::{Iperf3Runner, ServerPool, detect_controller, list_presets, preset};
use flowlab_engine::{
    AnalysisReport, SchedulerConfig, SweepReport, TestReport, TestSummary, analyze,
    analyze_with_threshold, export_sweep_csv, format_bits, format_bytes, load_sweep_report,
    run_sweep, run_test, save_sweep_report, save_test_report,
};

use crate::{RunArgs, SweepArgs, TrafficArgs};

fn load_toml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse {what} {}", path.display()))
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("--{flag} must be a non-negative number of seconds"))
}

impl TrafficArgs {
    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            base_port: self.base_port,
            num_ports: self.ports,
            grace_period: seconds(self.grace, "grace")?,
            seed: self.seed,
            elephant_retry_backoff: seconds(self.elephant_backoff, "elephant-backoff")?,
        })
    }

    fn runner(&self) -> Result<Arc<Iperf3Runner>> {
        let margin = seconds(self.timeout_margin, "timeout-margin")?;
        Ok(Arc::new(
            Iperf3Runner::new(self.server.clone()).with_timeout_margin(margin),
        ))
    }

    fn output_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.output)
            .with_context(|| format!("Failed to create {}", self.output.display()))?;
        Ok(&self.output)
    }
}

pub async fn run(args: RunArgs, abort: AbortSignal) -> Result<()> {
    let mut profile: Profile = load_toml(&args.profile, "profile")?;
    if let Some(duration) = args.duration {
        profile.flows.duration_secs = duration;
    }
    let config = args.traffic.scheduler_config()?;
    let runner = args.traffic.runner()?;
    info!(
        profile = %profile.name,
        server = %args.traffic.server,
        ports = %format!("{}-{}", config.base_port, config.base_port.saturating_add(config.num_ports.saturating_sub(1))),
        "starting test"
    );

    let outcome = run_test(&profile, runner, config, abort).await?;
    log_summary(&outcome.profile_name, &outcome.summary);

    let report = TestReport::from(outcome);
    let path = save_test_report(args.traffic.output_dir()?, &report)?;
    info!(path = %path.display(), "results written");
    Ok(())
}

/// Decide which conditions, if any, the sweep imposes.
pub fn resolve_environment(
    scenario: &Scenario,
    preset_name: Option<&str>,
    environment: Option<NetworkEnvironment>,
    disabled: bool,
) -> Result<Option<NetworkEnvironment>> {
    if disabled {
        return Ok(None);
    }
    if let Some(env) = environment {
        return Ok(Some(env));
    }
    let named = preset_name.or(scenario.environment_preset.as_deref());
    if let Some(name) = named {
        return preset(name)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown environment preset '{name}' (see `flowlab presets`)"));
    }
    Ok(scenario.environment.clone())
}

pub async fn sweep(args: SweepArgs, abort: AbortSignal) -> Result<()> {
    let mut scenario: Scenario = load_toml(&args.scenario, "scenario")?;
    if let Some(clients) = &args.clients {
        scenario.client_counts = clients.clone();
    }
    if let Some(delay) = args.delay {
        scenario.inter_test_delay_secs = delay;
    }
    if let Some(duration) = args.duration {
        scenario.duration_secs = duration;
    }

    let environment = match &args.environment {
        Some(path) => Some(load_toml::<NetworkEnvironment>(path, "environment")?),
        None => None,
    };
    scenario.environment =
        resolve_environment(&scenario, args.preset.as_deref(), environment, args.no_environment)?;
    scenario.environment_preset = None;

    let controller = match &scenario.environment {
        Some(env) => {
            info!(environment = %env.name, "network conditioning enabled");
            Some(detect_controller(args.interface.clone()).await)
        }
        None => None,
    };

    let config = args.traffic.scheduler_config()?;
    let runner = args.traffic.runner()?;
    info!(
        scenario = %scenario.name,
        client_counts = ?scenario.client_counts,
        server = %args.traffic.server,
        "starting sweep"
    );

    let output = args.traffic.output_dir()?;
    match run_sweep(scenario, runner, controller, config, abort).await {
        Ok(sweep) => {
            for point in &sweep.points {
                log_summary(&format!("{} clients", point.client_count), &point.summary);
            }
            if sweep.cancelled {
                warn!(points = sweep.points.len(), "sweep cancelled, saving completed points");
            }
            let analysis = analyze(&sweep);
            log_analysis(&analysis);
            save_sweep_report(output, &SweepReport::new(sweep, Some(analysis)))?;
            Ok(())
        }
        Err(err) => {
            if let Some(partial) = err.partial()
                && !partial.points.is_empty()
            {
                let partial = partial.clone();
                let analysis = analyze(&partial);
                match save_sweep_report(output, &SweepReport::new(partial, Some(analysis))) {
                    Ok(path) => warn!(path = %path.display(), "partial sweep saved"),
                    Err(save_err) => error!(error = %save_err, "could not save partial sweep"),
                }
            }
            Err(err.into())
        }
    }
}

pub fn analyze_report(path: &Path, threshold: Option<f64>) -> Result<()> {
    let report = load_sweep_report(path)?;
    let analysis = match threshold {
        Some(threshold) => analyze_with_threshold(&report.sweep, threshold),
        None => analyze(&report.sweep),
    };
    log_analysis(&analysis);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

pub fn export_csv(report: &Path, output: &Path) -> Result<()> {
    let report = load_sweep_report(report)?;
    export_sweep_csv(&report.sweep, output)?;
    Ok(())
}

pub fn presets() {
    for (name, description) in list_presets() {
        println!("{name:<22} {description}");
    }
}

pub async fn env_status(interface: Option<String>) -> Result<()> {
    let controller = detect_controller(interface).await;
    let status = controller
        .status()
        .await
        .with_context(|| format!("Failed to query {} status", controller.name()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn server(base_port: u16, ports: u16, abort: AbortSignal) -> Result<()> {
    let pool = ServerPool::new(base_port, ports)?;
    let (first, last) = pool.port_range();
    info!(first, last, "serving until interrupted");
    let stats = pool.run(abort).await;
    if stats.sessions == 0 && stats.spawn_failures > 0 {
        return Err(anyhow!("no iperf3 server could be started (is iperf3 installed?)"));
    }
    Ok(())
}

fn log_summary(label: &str, summary: &TestSummary) {
    info!(
        run = label,
        duration_s = %format!("{:.1}", summary.test_duration_seconds),
        flows = summary.total_flows,
        ok = summary.successful_flows,
        failed = summary.failed_flows,
        success = %format!("{:.1}%", summary.success_rate_pct),
        transferred = %format_bytes(summary.total_bytes),
        throughput = %format_bits(summary.aggregate_throughput_bps),
        retransmits = summary.total_retransmits,
        cancelled = summary.cancelled,
        "test finished"
    );
    for (kind, count) in &summary.failures {
        warn!(run = label, failure = %kind, count, "flow failures");
    }
}

fn log_analysis(analysis: &AnalysisReport) {
    if let Some(peak) = &analysis.peak {
        info!(
            clients = peak.client_count,
            throughput = %format_bits(peak.throughput_bps),
            "peak aggregate throughput"
        );
    }
    match analysis.breaking_point.client_count {
        Some(clients) => warn!(
            clients,
            threshold = %format!("{:.0}%", analysis.breaking_point.threshold_pct),
            "success rate fell below threshold"
        ),
        None => info!("no breaking point within the swept range"),
    }
    if let Some(efficiency) = analysis.scaling.efficiency_pct {
        info!(efficiency = %format!("{efficiency:.1}%"), "scaling efficiency");
    }
    if analysis.monotonic_degradation {
        warn!("per-client throughput degrades with every added client step");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(raw: &str) -> Scenario {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn scenario_preset_is_resolved() {
        let scenario = scenario(
            r#"
            name = "mobile ramp"
            client_counts = [5, 10]
            environment_preset = "3g-mobile"
            "#,
        );
        let env = resolve_environment(&scenario, None, None, false).unwrap().unwrap();
        assert_eq!(env.name, "3G Mobile");
    }

    #[test]
    fn flags_take_precedence_over_the_scenario() {
        let scenario = scenario(r#"environment_preset = "3g-mobile""#);
        let env = resolve_environment(&scenario, Some("satellite"), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(env.name, "Satellite");

        let custom = NetworkEnvironment {
            name: "bench".to_string(),
            ..Default::default()
        };
        let env = resolve_environment(&scenario, None, Some(custom), false)
            .unwrap()
            .unwrap();
        assert_eq!(env.name, "bench");

        assert!(resolve_environment(&scenario, None, None, true).unwrap().is_none());
    }

    #[test]
    fn unknown_preset_is_an_error() {
        let err = resolve_environment(&Scenario::default(), Some("dial-up"), None, false)
            .unwrap_err();
        assert!(err.to_string().contains("dial-up"));
    }

    #[test]
    fn inline_environment_is_kept() {
        let scenario = scenario(
            r#"
            [environment]
            name = "lab"
            [environment.latency]
            delay_ms = 25
            "#,
        );
        let env = resolve_environment(&scenario, None, None, false).unwrap().unwrap();
        assert_eq!(env.latency.delay_ms, 25.0);
        assert!(resolve_environment(&Scenario::default(), None, None, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(seconds(-1.0, "grace").is_err());
        assert_eq!(seconds(2.5, "grace").unwrap(), Duration::from_millis(2500));
    }
}
