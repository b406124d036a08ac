use crate::collector::TestSummary;
use crate::error::{EnvironmentPhase, SweepError};
use crate::ports::PortPool;
use crate::scheduler::{FlowScheduler, SchedulerConfig};
use chrono::{DateTime, Utc};
use flowlab_abstract::{
    AbortSignal, ConfigError, FlowRunner, NetworkEnvironment, NetworkEnvironmentController,
    Scenario,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One completed test within a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub client_count: u32,
    pub summary: TestSummary,
    pub throughput_per_client_bps: f64,
    pub flows_per_client: f64,
    pub bytes_per_client: f64,
    /// Name of the environment applied around this point.
    pub environment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SweepPoint {
    pub fn new(client_count: u32, summary: TestSummary, environment: Option<String>) -> Self {
        let clients = f64::from(client_count.max(1));
        Self {
            client_count,
            throughput_per_client_bps: summary.aggregate_throughput_bps / clients,
            flows_per_client: summary.total_flows as f64 / clients,
            bytes_per_client: summary.total_bytes as f64 / clients,
            summary,
            environment,
            timestamp: Utc::now(),
        }
    }
}

/// Points are kept in the scenario's `client_counts` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub name: String,
    pub description: String,
    pub parameter: String,
    pub client_counts: Vec<u32>,
    pub environment: Option<String>,
    pub started_at: DateTime<Utc>,
    pub points: Vec<SweepPoint>,
    #[serde(default)]
    pub cancelled: bool,
}

impl SweepResult {
    pub fn new(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            description: scenario.description.clone(),
            parameter: "num_clients".to_string(),
            client_counts: scenario.client_counts.clone(),
            environment: None,
            started_at: Utc::now(),
            points: Vec::new(),
            cancelled: false,
        }
    }

    pub fn point(&self, client_count: u32) -> Option<&SweepPoint> {
        self.points.iter().find(|p| p.client_count == client_count)
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.points.len() == self.client_counts.len()
    }
}

/// Runs one scaled test per client count, one after another.
pub struct ScenarioSweepRunner {
    scenario: Scenario,
    runner: Arc<dyn FlowRunner>,
    controller: Option<Arc<dyn NetworkEnvironmentController>>,
    config: SchedulerConfig,
}

impl ScenarioSweepRunner {
    /// Every point's scaled profile is validated here, before anything runs.
    pub fn new(
        scenario: Scenario,
        runner: Arc<dyn FlowRunner>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        scenario.validate()?;
        for &clients in &scenario.client_counts {
            scenario.profile_for(clients).validate()?;
        }
        PortPool::new(config.base_port, config.num_ports)?;
        Ok(Self {
            scenario,
            runner,
            controller: None,
            config,
        })
    }

    /// Bracket every point with `apply`/`clear` of the scenario's environment.
    pub fn with_controller(mut self, controller: Arc<dyn NetworkEnvironmentController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub async fn run(&self, abort: AbortSignal) -> Result<SweepResult, SweepError> {
        let mut result = SweepResult::new(&self.scenario);
        let conditioning = self.conditioning();
        let env_name = conditioning.map(|(_, env)| env.name.clone());
        result.environment = env_name.clone();
        let total = self.scenario.client_counts.len();
        let delay = self.scenario.inter_test_delay();

        info!(
            scenario = %self.scenario.name,
            points = total,
            environment = env_name.as_deref().unwrap_or("none"),
            "sweep started"
        );

        for (index, &clients) in self.scenario.client_counts.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                debug!(delay_secs = delay.as_secs_f64(), "waiting for link to quiesce");
                tokio::select! {
                    biased;
                    _ = abort.aborted() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if abort.is_aborted() {
                info!(completed = result.points.len(), "sweep aborted");
                result.cancelled = true;
                return Ok(result);
            }

            info!(clients, point = index + 1, of = total, "running sweep point");
            let profile = self.scenario.profile_for(clients);
            let config = SchedulerConfig {
                seed: self.config.seed.map(|seed| seed.wrapping_add(index as u64)),
                ..self.config.clone()
            };
            let scheduler = FlowScheduler::new(profile.flows, Arc::clone(&self.runner), config)?;
            if let Some((controller, env)) = conditioning
                && let Err(source) = controller.apply(env).await
            {
                error!(clients, controller = controller.name(), error = %source, "failed to apply network environment");
                if let Err(err) = controller.clear().await {
                    warn!(error = %err, "cleanup after failed apply also failed");
                }
                return Err(SweepError::Environment {
                    client_count: clients,
                    phase: EnvironmentPhase::Apply,
                    source,
                    partial: Box::new(result),
                });
            }

            let outcome = scheduler.run(abort.clone()).await;

            let cleared = match conditioning {
                Some((controller, _)) => controller.clear().await,
                None => Ok(()),
            };

            let summary = match outcome {
                Ok((summary, _)) => summary,
                Err(source) => {
                    if let Err(err) = cleared {
                        warn!(error = %err, "failed to clear network environment");
                    }
                    return Err(SweepError::Aggregation {
                        client_count: clients,
                        source,
                        partial: Box::new(result),
                    });
                }
            };

            let cancelled = summary.cancelled;
            info!(
                clients,
                throughput_bps = summary.aggregate_throughput_bps,
                success_rate_pct = summary.success_rate_pct,
                "sweep point finished"
            );
            result
                .points
                .push(SweepPoint::new(clients, summary, env_name.clone()));

            if let Err(source) = cleared {
                error!(clients, error = %source, "failed to clear network environment");
                return Err(SweepError::Environment {
                    client_count: clients,
                    phase: EnvironmentPhase::Clear,
                    source,
                    partial: Box::new(result),
                });
            }
            if cancelled {
                info!(completed = result.points.len(), "sweep aborted");
                result.cancelled = true;
                return Ok(result);
            }
        }

        info!(scenario = %self.scenario.name, "sweep finished");
        Ok(result)
    }

    fn conditioning(&self) -> Option<(&dyn NetworkEnvironmentController, &NetworkEnvironment)> {
        match (&self.controller, &self.scenario.environment) {
            (Some(controller), Some(env)) => Some((controller.as_ref(), env)),
            (Some(_), None) => {
                debug!("controller supplied without an environment, links left untouched");
                None
            }
            (None, Some(env)) => {
                warn!(environment = %env.name, "environment configured but no controller supplied");
                None
            }
            (None, None) => None,
        }
    }
}

pub async fn run_sweep(
    scenario: Scenario,
    runner: Arc<dyn FlowRunner>,
    controller: Option<Arc<dyn NetworkEnvironmentController>>,
    config: SchedulerConfig,
    abort: AbortSignal,
) -> Result<SweepResult, SweepError> {
    let mut sweep = ScenarioSweepRunner::new(scenario, runner, config)?;
    if let Some(controller) = controller {
        sweep = sweep.with_controller(controller);
    }
    sweep.run(abort).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{RecordingController, Script, ScriptedRunner};
    use flowlab_abstract::{ClientProfile, abort_pair};
    use std::time::Duration;

    fn scenario(counts: &[u32]) -> Scenario {
        Scenario {
            name: "ramp".to_string(),
            duration_secs: 1.0,
            client_counts: counts.to_vec(),
            client_profile: ClientProfile {
                mice_size_range: (1000, 1000),
                mice_duration_range: (0.1, 0.2),
                mice_rate: 2.0,
                mice_concurrent: 2,
                ..Default::default()
            },
            inter_test_delay_secs: 1.0,
            environment: Some(NetworkEnvironment {
                name: "lab".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            seed: Some(3),
            ..Default::default()
        }
    }

    fn runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(Script::Succeed))
    }

    #[tokio::test(start_paused = true)]
    async fn points_follow_input_order() {
        let result = run_sweep(scenario(&[30, 10, 20]), runner(), None, config(), AbortSignal::never())
            .await
            .unwrap();

        let order: Vec<u32> = result.points.iter().map(|p| p.client_count).collect();
        assert_eq!(order, vec![30, 10, 20]);
        assert_eq!(result.client_counts, vec![30, 10, 20]);
        assert!(result.is_complete());

        // 2 flows/s per client for 1 s, 1000 bytes each
        let ten = result.point(10).unwrap();
        assert_eq!(ten.summary.total_flows, 20);
        assert_eq!(ten.bytes_per_client, 2000.0);
        assert_eq!(ten.flows_per_client, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn brackets_each_point_with_apply_and_clear() {
        let controller = Arc::new(RecordingController::default());
        let result = run_sweep(
            scenario(&[10, 20]),
            runner(),
            Some(controller.clone()),
            config(),
            AbortSignal::never(),
        )
        .await
        .unwrap();

        assert_eq!(
            controller.calls(),
            vec!["apply:lab", "clear", "apply:lab", "clear"]
        );
        assert_eq!(result.environment.as_deref(), Some("lab"));
        assert_eq!(result.points[1].environment.as_deref(), Some("lab"));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_keeps_completed_points() {
        let controller = Arc::new(RecordingController::failing_apply(2));
        let err = run_sweep(
            scenario(&[10, 20, 30]),
            runner(),
            Some(controller.clone()),
            config(),
            AbortSignal::never(),
        )
        .await
        .unwrap_err();

        match &err {
            SweepError::Environment {
                client_count, phase, ..
            } => {
                assert_eq!(*client_count, 20);
                assert_eq!(*phase, EnvironmentPhase::Apply);
            }
            other => panic!("unexpected error: {other}"),
        }
        let partial = err.into_partial().unwrap();
        assert_eq!(partial.points.len(), 1);
        assert_eq!(partial.points[0].client_count, 10);
        assert_eq!(
            controller.calls(),
            vec!["apply:lab", "clear", "apply:lab", "clear"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_failure_stops_after_recording_the_point() {
        let controller = Arc::new(RecordingController::failing_clear(1));
        let err = run_sweep(
            scenario(&[10, 20]),
            runner(),
            Some(controller),
            config(),
            AbortSignal::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            SweepError::Environment {
                phase: EnvironmentPhase::Clear,
                client_count: 10,
                ..
            }
        ));
        assert_eq!(err.partial().unwrap().points.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregation_failure_surfaces_with_partial_sweep() {
        let runner = Arc::new(ScriptedRunner::new(Script::WrongId));
        let err = run_sweep(scenario(&[10, 20]), runner, None, config(), AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Aggregation { client_count: 10, .. }));
        assert!(err.partial().unwrap().points.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_quiesce_delay_returns_partial_sweep() {
        let mut scenario = scenario(&[10, 20, 30]);
        scenario.inter_test_delay_secs = 5.0;
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            handle.abort();
        });

        let result = run_sweep(scenario, runner(), None, config(), signal)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.is_complete());
        assert_eq!(result.points.len(), 1);
    }

    #[test]
    fn rejects_invalid_scenarios_up_front() {
        let scenario = Scenario {
            client_counts: vec![],
            ..Default::default()
        };
        let err = ScenarioSweepRunner::new(scenario, runner(), config()).err();
        assert_eq!(err, Some(ConfigError::NoClientCounts));
    }
}
