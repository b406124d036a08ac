use crate::collector::{ResultsCollector, TestSummary};
use crate::error::RunError;
use crate::ports::PortPool;
use flowlab_abstract::{
    AbortSignal, AggregationError, ConfigError, FailureKind, Flow, FlowFailure, FlowId, FlowKind,
    FlowResult, FlowRunner, FlowSpec, Profile,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub base_port: u16,
    pub num_ports: u16,
    /// How long outstanding flows may run past the deadline before they are timed out.
    pub grace_period: Duration,
    /// Fixed seed for size/duration sampling. Drawn from the OS when `None`.
    pub seed: Option<u64>,
    /// Pause before replacing an elephant flow that failed. Zero refills immediately.
    pub elephant_retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_port: 5201,
            num_ports: 50,
            grace_period: Duration::from_secs(10),
            seed: None,
            elephant_retry_backoff: Duration::ZERO,
        }
    }
}

/// Everything one test run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub profile_name: String,
    pub summary: TestSummary,
    pub flows: Vec<FlowResult>,
}

/// Paces mice arrivals and keeps elephant concurrency topped up for one run.
pub struct FlowScheduler {
    spec: FlowSpec,
    runner: Arc<dyn FlowRunner>,
    pool: PortPool,
    grace_period: Duration,
    seed: Option<u64>,
    retry_backoff: Duration,
}

impl FlowScheduler {
    pub fn new(
        spec: FlowSpec,
        runner: Arc<dyn FlowRunner>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        let horizon = Instant::now()
            .checked_add(spec.duration())
            .and_then(|deadline| deadline.checked_add(config.grace_period));
        if horizon.is_none() {
            return Err(ConfigError::DurationOutOfRange {
                field: "duration",
                value: spec.duration_secs + config.grace_period.as_secs_f64(),
            });
        }
        let pool = PortPool::new(config.base_port, config.num_ports)?;
        Ok(Self {
            spec,
            runner,
            pool,
            grace_period: config.grace_period,
            seed: config.seed,
            retry_backoff: config.elephant_retry_backoff,
        })
    }

    /// Run until the deadline (or `abort`), then drain outstanding flows.
    ///
    /// Only collector invariant violations are returned as errors; flow failures
    /// are part of the summary.
    pub async fn run(
        self,
        abort: AbortSignal,
    ) -> Result<(TestSummary, Vec<FlowResult>), AggregationError> {
        let mut run = Run::new(self);
        info!(
            duration_secs = run.spec.duration_secs,
            mice = run.spec.mice.enabled,
            elephant = run.spec.elephant.enabled,
            "test run started"
        );

        let mut cancelled = run.drive(&abort).await?;
        if run.deferred_mice > 0 {
            info!(
                discarded = run.deferred_mice,
                "deferred mice arrivals discarded"
            );
            run.collector.note_discarded_arrivals(run.deferred_mice);
            run.deferred_mice = 0;
        }
        if !cancelled {
            cancelled = run.drain(&abort).await?;
        }
        if cancelled {
            run.cancel()?;
        }
        run.tasks.shutdown().await;

        let elapsed = run.started.elapsed();
        let (summary, records) = run.collector.finish(elapsed, cancelled);
        info!(
            total = summary.total_flows,
            successful = summary.successful_flows,
            failed = summary.failed_flows,
            success_rate_pct = summary.success_rate_pct,
            cancelled,
            "test run finished"
        );
        Ok((summary, records))
    }
}

struct Run {
    spec: FlowSpec,
    runner: Arc<dyn FlowRunner>,
    pool: PortPool,
    rng: StdRng,
    grace_period: Duration,
    retry_backoff: Duration,
    collector: ResultsCollector,
    tasks: JoinSet<()>,
    task_flows: HashMap<task::Id, FlowId>,
    results_tx: mpsc::UnboundedSender<FlowResult>,
    results_rx: mpsc::UnboundedReceiver<FlowResult>,
    next_id: FlowId,
    started: Instant,
    deadline: Instant,
    mice_interval: Option<Duration>,
    next_arrival: Option<Instant>,
    /// Arrivals that are due but waiting for a mice slot.
    deferred_mice: u64,
    refills: BinaryHeap<Reverse<Instant>>,
}

impl Run {
    fn new(scheduler: FlowScheduler) -> Self {
        let rng = match scheduler.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let spec = scheduler.spec;

        let mice_interval = if spec.mice.enabled {
            spec.mice.interval()
        } else {
            None
        };
        let mut refills = BinaryHeap::new();
        if spec.elephant.enabled {
            for _ in 0..spec.elephant.concurrent {
                refills.push(Reverse(started));
            }
        }

        Self {
            // bounded by the horizon check in FlowScheduler::new
            deadline: started.checked_add(spec.duration()).unwrap_or(started),
            spec,
            runner: scheduler.runner,
            pool: scheduler.pool,
            rng,
            grace_period: scheduler.grace_period,
            retry_backoff: scheduler.retry_backoff,
            collector: ResultsCollector::new(),
            tasks: JoinSet::new(),
            task_flows: HashMap::new(),
            results_tx,
            results_rx,
            next_id: 1,
            started,
            mice_interval,
            next_arrival: mice_interval.map(|_| started),
            deferred_mice: 0,
            refills,
        }
    }

    /// Main phase. Returns `true` when aborted before the deadline.
    async fn drive(&mut self, abort: &AbortSignal) -> Result<bool, AggregationError> {
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                return Ok(false);
            }
            self.admit_due(now)?;

            let wake = [
                self.next_arrival,
                self.refills.peek().map(|Reverse(at)| *at),
            ]
            .into_iter()
            .flatten()
            .fold(self.deadline, Instant::min);

            tokio::select! {
                biased;
                _ = abort.aborted() => return Ok(true),
                Some(result) = self.results_rx.recv() => self.complete(result)?,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.reap(joined)?
                }
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Grace phase. Returns `true` when aborted while draining.
    async fn drain(&mut self, abort: &AbortSignal) -> Result<bool, AggregationError> {
        let now = Instant::now();
        let grace_deadline = now.checked_add(self.grace_period).unwrap_or(now);
        while self.collector.outstanding() > 0 {
            tokio::select! {
                biased;
                _ = abort.aborted() => return Ok(true),
                Some(result) = self.results_rx.recv() => self.complete(result)?,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.reap(joined)?
                }
                _ = sleep_until(grace_deadline) => {
                    self.expire()?;
                    break;
                }
            }
        }
        Ok(false)
    }

    fn admit_due(&mut self, now: Instant) -> Result<(), AggregationError> {
        if let Some(interval) = self.mice_interval
            && let Some(at) = self.next_arrival
            && at <= now
        {
            let gap = interval.as_nanos();
            let due = now.duration_since(at).as_nanos() / gap + 1;
            self.deferred_mice = self
                .deferred_mice
                .saturating_add(u64::try_from(due).unwrap_or(u64::MAX));
            self.next_arrival = gap
                .checked_mul(due)
                .and_then(|nanos| u64::try_from(nanos).ok())
                .and_then(|nanos| at.checked_add(Duration::from_nanos(nanos)));
        }

        let limit = u64::from(self.spec.mice.concurrent);
        while self.deferred_mice > 0 && self.collector.in_flight(FlowKind::Mice) < limit {
            self.deferred_mice -= 1;
            self.dispatch(FlowKind::Mice, now)?;
        }

        while let Some(Reverse(at)) = self.refills.peek().copied()
            && at <= now
        {
            self.refills.pop();
            self.dispatch(FlowKind::Elephant, now)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, kind: FlowKind, now: Instant) -> Result<(), AggregationError> {
        let id = self.next_id;
        self.next_id += 1;

        let (size_bytes, duration, bandwidth) = match kind {
            FlowKind::Mice => {
                let (min_size, max_size) = self.spec.mice.size_range;
                let (min_secs, max_secs) = self.spec.mice.duration_range;
                (
                    Some(self.rng.random_range(min_size..=max_size)),
                    Duration::from_secs_f64(self.rng.random_range(min_secs..=max_secs)),
                    None,
                )
            }
            FlowKind::Elephant => (
                None,
                self.deadline.saturating_duration_since(now),
                self.spec.elephant.bandwidth().map(str::to_string),
            ),
        };

        let port = self.pool.acquire(kind);
        let flow = Flow {
            id,
            kind,
            port: port.unwrap_or_default(),
            size_bytes,
            duration,
            bandwidth,
            scheduled_at: now.saturating_duration_since(self.started),
        };
        self.collector.register(flow.clone());

        if port.is_none() {
            debug!(flow_id = id, %kind, "no port available");
            let failure = FlowFailure::new(FailureKind::NoPortAvailable, "port pool is empty");
            let flow = self.collector.record_failure(id, failure, flow.scheduled_at)?;
            self.finished(&flow, false, now);
            return Ok(());
        }

        debug!(
            flow_id = id,
            %kind,
            port = flow.port,
            size_bytes = ?flow.size_bytes,
            duration_ms = flow.duration.as_millis() as u64,
            "dispatching flow"
        );
        let runner = Arc::clone(&self.runner);
        let results = self.results_tx.clone();
        let started = self.started;
        let handle = self.tasks.spawn(async move {
            let mut result = runner.execute(flow).await;
            result.finished_at = started.elapsed().as_secs_f64();
            // The receiver lives as long as the run; a send error means it was torn down.
            let _ = results.send(result);
        });
        self.task_flows.insert(handle.id(), id);
        Ok(())
    }

    fn complete(&mut self, result: FlowResult) -> Result<(), AggregationError> {
        let success = result.success;
        if let Some(failure) = &result.failure {
            debug!(flow_id = result.flow_id, kind = %result.kind, %failure, "flow failed");
        }
        let flow = self.collector.record(result)?;
        self.finished(&flow, success, Instant::now());
        Ok(())
    }

    fn finished(&mut self, flow: &Flow, success: bool, now: Instant) {
        self.pool.release(flow.kind, flow.port);
        if flow.kind == FlowKind::Elephant && now < self.deadline {
            let at = if success {
                Some(now)
            } else {
                now.checked_add(self.retry_backoff)
            };
            if let Some(at) = at {
                self.refills.push(Reverse(at));
            }
        }
    }

    fn reap(&mut self, joined: Result<(task::Id, ()), JoinError>) -> Result<(), AggregationError> {
        match joined {
            Ok((task_id, ())) => {
                self.task_flows.remove(&task_id);
            }
            Err(err) => {
                let flow_id = self.task_flows.remove(&err.id());
                if err.is_panic()
                    && let Some(flow_id) = flow_id
                    && self.collector.is_outstanding(flow_id)
                {
                    warn!(flow_id, "flow runner panicked");
                    let failure = FlowFailure::new(FailureKind::ProtocolError, "flow runner panicked");
                    let flow = self
                        .collector
                        .record_failure(flow_id, failure, self.started.elapsed())?;
                    self.finished(&flow, false, Instant::now());
                }
            }
        }
        Ok(())
    }

    fn drain_ready(&mut self) -> Result<(), AggregationError> {
        while let Ok(result) = self.results_rx.try_recv() {
            self.complete(result)?;
        }
        Ok(())
    }

    /// Grace period ran out: stop whatever is left and record it as timed out.
    fn expire(&mut self) -> Result<(), AggregationError> {
        self.tasks.abort_all();
        self.drain_ready()?;

        let pending = self.collector.outstanding_ids();
        if !pending.is_empty() {
            info!(count = pending.len(), "flows still running after grace period, recording timeouts");
        }
        let now = self.started.elapsed();
        for id in pending {
            let failure = FlowFailure::new(FailureKind::Timeout, "no result within grace period");
            let flow = self.collector.record_failure(id, failure, now)?;
            self.pool.release(flow.kind, flow.port);
        }
        Ok(())
    }

    /// Abort: keep results that already arrived, abandon the rest.
    fn cancel(&mut self) -> Result<(), AggregationError> {
        self.tasks.abort_all();
        self.drain_ready()?;
        let abandoned = self.collector.abandon_outstanding();
        info!(
            abandoned = abandoned.len(),
            recorded = self.collector.records().len(),
            "test run cancelled"
        );
        for flow in abandoned {
            self.pool.release(flow.kind, flow.port);
        }
        Ok(())
    }
}

/// Validate `profile`, then run it to completion against `runner`.
pub async fn run_test(
    profile: &Profile,
    runner: Arc<dyn FlowRunner>,
    config: SchedulerConfig,
    abort: AbortSignal,
) -> Result<TestRun, RunError> {
    profile.validate()?;
    info!(profile = %profile.name, "running test profile");
    let scheduler = FlowScheduler::new(profile.flows.clone(), runner, config)?;
    let (summary, flows) = scheduler.run(abort).await?;
    Ok(TestRun {
        profile_name: profile.name.clone(),
        summary,
        flows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Script, ScriptedRunner};
    use flowlab_abstract::{ElephantSpec, MiceSpec, abort_pair};

    fn mice_only(duration_secs: f64, rate: f64, concurrent: u32) -> FlowSpec {
        FlowSpec {
            duration_secs,
            mice: MiceSpec {
                enabled: true,
                size_range: (1000, 5000),
                duration_range: (0.5, 1.0),
                concurrent,
                rate,
            },
            elephant: ElephantSpec::default(),
        }
    }

    fn seeded() -> SchedulerConfig {
        SchedulerConfig {
            seed: Some(42),
            ..Default::default()
        }
    }

    async fn run(spec: FlowSpec, runner: Arc<ScriptedRunner>, config: SchedulerConfig) -> TestSummary {
        let scheduler = FlowScheduler::new(spec, runner, config).unwrap();
        scheduler.run(AbortSignal::never()).await.unwrap().0
    }

    #[tokio::test(start_paused = true)]
    async fn mice_in_flight_never_exceeds_bound() {
        let runner = Arc::new(ScriptedRunner::new(Script::Succeed));
        let summary = run(mice_only(5.0, 100.0, 3), runner.clone(), seeded()).await;

        assert!(runner.peak_mice() <= 3);
        assert!(summary.peak_concurrent_mice <= 3);
        assert_eq!(summary.total_flows, summary.successful_flows + summary.failed_flows);
        assert_eq!(summary.success_rate_pct, 100.0);
        assert!(summary.mice_arrivals_discarded > 0);
        assert!(summary.total_flows + summary.mice_arrivals_discarded <= 500);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_mice_never_run() {
        let runner = Arc::new(ScriptedRunner::new(Script::Succeed));
        let spec = FlowSpec {
            duration_secs: 3.0,
            mice: MiceSpec {
                enabled: false,
                rate: 1000.0,
                concurrent: 100,
                ..Default::default()
            },
            elephant: ElephantSpec {
                enabled: true,
                concurrent: 2,
                bandwidth: Some("10M".to_string()),
            },
        };
        let summary = run(spec, runner.clone(), seeded()).await;

        assert_eq!(runner.calls(FlowKind::Mice), 0);
        assert_eq!(summary.mice_flows.total, 0);
        assert_eq!(summary.elephant_flows.total, 2);
        assert_eq!(summary.elephant_flows.successful, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn elephants_are_replaced_as_they_finish() {
        let runner = Arc::new(
            ScriptedRunner::new(Script::Succeed).holding(Duration::from_millis(900)),
        );
        let spec = FlowSpec {
            duration_secs: 5.0,
            mice: MiceSpec {
                enabled: false,
                ..Default::default()
            },
            elephant: ElephantSpec {
                enabled: true,
                concurrent: 2,
                bandwidth: None,
            },
        };
        let summary = run(spec, runner, seeded()).await;

        // each slot starts at 0, 0.9, 1.8, 2.7, 3.6 and 4.5 s
        assert_eq!(summary.elephant_flows.total, 12);
        assert_eq!(summary.peak_concurrent_elephant, 2);
    }

    fn one_elephant(duration_secs: f64) -> FlowSpec {
        FlowSpec {
            duration_secs,
            mice: MiceSpec {
                enabled: false,
                ..Default::default()
            },
            elephant: ElephantSpec {
                enabled: true,
                concurrent: 1,
                bandwidth: None,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_elephants_are_replaced_immediately() {
        let runner = Arc::new(
            ScriptedRunner::new(Script::Fail(FailureKind::Refused))
                .holding(Duration::from_millis(300)),
        );
        let summary = run(one_elephant(2.0), runner.clone(), seeded()).await;

        // attempts at 0, 0.3, 0.6, 0.9, 1.2, 1.5 and 1.8 s with no gap in between
        assert_eq!(summary.elephant_flows.failed, 7);
        assert_eq!(summary.peak_concurrent_elephant, 1);
        assert_eq!(summary.success_rate_pct, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn elephant_retry_backoff_is_opt_in() {
        let runner = Arc::new(
            ScriptedRunner::new(Script::Fail(FailureKind::Refused))
                .holding(Duration::from_millis(300)),
        );
        let config = SchedulerConfig {
            elephant_retry_backoff: Duration::from_millis(500),
            ..seeded()
        };
        let summary = run(one_elephant(2.0), runner, config).await;

        // attempts at 0, 0.8 and 1.6 s
        assert_eq!(summary.elephant_flows.failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_backlog_is_counted_in_one_step() {
        let runner = Arc::new(
            ScriptedRunner::new(Script::Succeed).holding(Duration::from_millis(100)),
        );
        let summary = run(mice_only(1.0, 1e8, 4), runner.clone(), seeded()).await;

        assert!(runner.peak_mice() <= 4);
        assert!(summary.total_flows > 0);
        assert!(summary.mice_arrivals_discarded > 0);
    }

    #[test]
    fn unschedulable_horizon_is_rejected() {
        let runner = Arc::new(ScriptedRunner::new(Script::Succeed));
        let config = SchedulerConfig {
            grace_period: Duration::MAX,
            ..seeded()
        };
        let err = FlowScheduler::new(mice_only(1.0, 1.0, 1), runner, config).err();
        assert!(matches!(err, Some(ConfigError::DurationOutOfRange { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_is_reported_not_raised() {
        let runner = Arc::new(ScriptedRunner::new(Script::Fail(FailureKind::Refused)));
        let summary = run(mice_only(2.0, 5.0, 10), runner, seeded()).await;

        assert!(summary.total_flows > 0);
        assert_eq!(summary.successful_flows, 0);
        assert_eq!(summary.success_rate_pct, 0.0);
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(
            summary.failures.get(&FailureKind::Refused),
            Some(&summary.total_flows)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abort_keeps_only_completed_flows() {
        let runner = Arc::new(
            ScriptedRunner::new(Script::Succeed).holding(Duration::from_millis(250)),
        );
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1020)).await;
            handle.abort();
        });

        let scheduler = FlowScheduler::new(mice_only(60.0, 10.0, 100), runner.clone(), seeded()).unwrap();
        let (summary, records) = scheduler.run(signal).await.unwrap();

        // arrivals every 100 ms from t=0; the ones at 0.8, 0.9 and 1.0 s are still running
        assert_eq!(runner.calls(FlowKind::Mice), 11);
        assert_eq!(summary.total_flows, 8);
        assert_eq!(records.len(), 8);
        assert!(summary.cancelled);
        assert!(summary.test_duration_seconds < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_records_timeouts() {
        let runner = Arc::new(ScriptedRunner::new(Script::Hang));
        let config = SchedulerConfig {
            grace_period: Duration::from_secs(3),
            ..seeded()
        };
        let summary = run(mice_only(1.0, 2.0, 10), runner, config).await;

        assert_eq!(summary.total_flows, 2);
        assert_eq!(summary.failures.get(&FailureKind::Timeout), Some(&2));
        assert!(summary.test_duration_seconds >= 4.0);
        assert!(!summary.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_runner_becomes_protocol_error() {
        let runner = Arc::new(ScriptedRunner::new(Script::Panic));
        let summary = run(mice_only(1.0, 4.0, 10), runner, seeded()).await;

        assert_eq!(summary.total_flows, 4);
        assert_eq!(summary.failures.get(&FailureKind::ProtocolError), Some(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_unknown_flow_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new(Script::WrongId));
        let scheduler = FlowScheduler::new(mice_only(1.0, 4.0, 10), runner, seeded()).unwrap();
        let err = scheduler.run(AbortSignal::never()).await.unwrap_err();
        assert!(matches!(err, AggregationError::UnknownFlow(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_port_pool_degrades_flows() {
        let runner = Arc::new(ScriptedRunner::new(Script::Succeed));
        let config = SchedulerConfig {
            num_ports: 0,
            ..seeded()
        };
        let summary = run(mice_only(1.0, 4.0, 10), runner.clone(), config).await;

        assert_eq!(runner.calls(FlowKind::Mice), 0);
        assert_eq!(summary.total_flows, 4);
        assert_eq!(summary.failures.get(&FailureKind::NoPortAvailable), Some(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn same_seed_samples_the_same_flows() {
        let first = run(
            mice_only(2.0, 10.0, 50),
            Arc::new(ScriptedRunner::new(Script::Succeed)),
            seeded(),
        )
        .await;
        let second = run(
            mice_only(2.0, 10.0, 50),
            Arc::new(ScriptedRunner::new(Script::Succeed)),
            seeded(),
        )
        .await;
        assert_eq!(first.total_flows, 20);
        assert_eq!(first.total_bytes, second.total_bytes);
    }

    #[tokio::test]
    async fn run_test_rejects_invalid_profiles() {
        let mut profile = Profile::default();
        profile.flows.mice.size_range = (10, 1);
        let runner = Arc::new(ScriptedRunner::new(Script::Succeed));
        let err = run_test(&profile, runner, seeded(), AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::InvalidRange { .. })));
    }
}
