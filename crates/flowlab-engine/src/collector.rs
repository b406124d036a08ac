use flowlab_abstract::{
    AggregationError, FailureKind, Flow, FlowFailure, FlowId, FlowKind, FlowResult,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::error;

/// Counts for one flow kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTypeSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate_pct: f64,
    pub total_bytes: u64,
}

/// Immutable view of a finished (or cancelled) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub test_duration_seconds: f64,
    pub mice_flows: FlowTypeSummary,
    pub elephant_flows: FlowTypeSummary,
    pub total_flows: u64,
    pub successful_flows: u64,
    pub failed_flows: u64,
    pub success_rate_pct: f64,
    /// Bytes moved by successful flows.
    pub total_bytes: u64,
    pub aggregate_throughput_bps: f64,
    /// Mean of the per-flow rates reported by successful flows.
    pub average_throughput_bps: f64,
    pub average_per_flow_throughput_bps: f64,
    pub total_retransmits: u64,
    pub average_jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub peak_concurrent_flows: u64,
    pub peak_concurrent_mice: u64,
    pub peak_concurrent_elephant: u64,
    pub mice_arrivals_discarded: u64,
    pub failures: BTreeMap<FailureKind, u64>,
    pub cancelled: bool,
}

#[derive(Debug, Default, Clone)]
struct Tally {
    total: u64,
    successful: u64,
    bytes: u64,
    bps_sum: f64,
    retransmits: u64,
    jitter_sum: f64,
    jitter_samples: u64,
    lost_packets: u64,
    total_packets: u64,
}

impl Tally {
    fn add(&mut self, result: &FlowResult) {
        self.total += 1;
        if !result.success {
            return;
        }
        self.successful += 1;
        self.bytes += result.bytes_transferred;
        self.bps_sum += result.bits_per_second;
        self.retransmits += result.retransmits;
        if let Some(jitter) = result.jitter_ms
            && jitter > 0.0
        {
            self.jitter_sum += jitter;
            self.jitter_samples += 1;
        }
        self.lost_packets += result.lost_packets;
        self.total_packets += result.total_packets;
    }

    fn merged(&self, other: &Tally) -> Tally {
        Tally {
            total: self.total + other.total,
            successful: self.successful + other.successful,
            bytes: self.bytes + other.bytes,
            bps_sum: self.bps_sum + other.bps_sum,
            retransmits: self.retransmits + other.retransmits,
            jitter_sum: self.jitter_sum + other.jitter_sum,
            jitter_samples: self.jitter_samples + other.jitter_samples,
            lost_packets: self.lost_packets + other.lost_packets,
            total_packets: self.total_packets + other.total_packets,
        }
    }

    fn type_summary(&self) -> FlowTypeSummary {
        FlowTypeSummary {
            total: self.total,
            successful: self.successful,
            failed: self.total - self.successful,
            success_rate_pct: success_rate(self.successful, self.total),
            total_bytes: self.bytes,
        }
    }
}

fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        100.0 * successful as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Concurrency {
    mice: u64,
    elephant: u64,
    peak_mice: u64,
    peak_elephant: u64,
    peak_total: u64,
}

impl Concurrency {
    fn slot(&mut self, kind: FlowKind) -> &mut u64 {
        match kind {
            FlowKind::Mice => &mut self.mice,
            FlowKind::Elephant => &mut self.elephant,
        }
    }

    fn started(&mut self, kind: FlowKind) {
        *self.slot(kind) += 1;
        self.peak_mice = self.peak_mice.max(self.mice);
        self.peak_elephant = self.peak_elephant.max(self.elephant);
        self.peak_total = self.peak_total.max(self.mice + self.elephant);
    }

    fn finished(&mut self, kind: FlowKind) {
        let slot = self.slot(kind);
        *slot = slot.saturating_sub(1);
    }
}

/// Single-owner aggregator for one run.
///
/// Flows are registered when dispatched and leave the outstanding set exactly once,
/// either through a recorded [`FlowResult`] or through [`ResultsCollector::abandon_outstanding`].
/// Producers never touch it directly; their results are funnelled to the owner over a channel.
#[derive(Debug, Default)]
pub struct ResultsCollector {
    outstanding: HashMap<FlowId, Flow>,
    recorded: HashSet<FlowId>,
    records: Vec<FlowResult>,
    mice: Tally,
    elephant: Tally,
    failures: BTreeMap<FailureKind, u64>,
    concurrency: Concurrency,
    discarded_arrivals: u64,
}

impl ResultsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a dispatched flow. Counts towards in-flight concurrency until it is recorded.
    pub fn register(&mut self, flow: Flow) {
        self.concurrency.started(flow.kind);
        self.outstanding.insert(flow.id, flow);
    }

    /// Record the outcome of a registered flow and hand the flow back to the caller.
    pub fn record(&mut self, result: FlowResult) -> Result<Flow, AggregationError> {
        let id = result.flow_id;
        let Some(flow) = self.outstanding.remove(&id) else {
            return Err(self.missing(id));
        };

        self.concurrency.finished(flow.kind);
        match flow.kind {
            FlowKind::Mice => self.mice.add(&result),
            FlowKind::Elephant => self.elephant.add(&result),
        }
        if !result.success {
            let kind = result.failure_kind().unwrap_or(FailureKind::ProtocolError);
            *self.failures.entry(kind).or_insert(0) += 1;
        }
        self.recorded.insert(id);
        self.records.push(result);
        Ok(flow)
    }

    /// Record a failure on behalf of a flow that produced no result of its own.
    pub fn record_failure(
        &mut self,
        id: FlowId,
        failure: FlowFailure,
        finished_at: Duration,
    ) -> Result<Flow, AggregationError> {
        let Some(flow) = self.outstanding.get(&id) else {
            return Err(self.missing(id));
        };
        let mut result = FlowResult::failed(flow, failure);
        result.finished_at = finished_at.as_secs_f64();
        self.record(result)
    }

    fn missing(&self, id: FlowId) -> AggregationError {
        let err = if self.recorded.contains(&id) {
            AggregationError::DuplicateResult(id)
        } else {
            AggregationError::UnknownFlow(id)
        };
        error!(%err, "collector invariant violated");
        err
    }

    /// Drop every outstanding flow without recording a result for it.
    pub fn abandon_outstanding(&mut self) -> Vec<Flow> {
        let abandoned: Vec<Flow> = self.outstanding.drain().map(|(_, flow)| flow).collect();
        for flow in &abandoned {
            self.concurrency.finished(flow.kind);
        }
        abandoned
    }

    pub fn outstanding_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<_> = self.outstanding.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_outstanding(&self, id: FlowId) -> bool {
        self.outstanding.contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn in_flight(&self, kind: FlowKind) -> u64 {
        match kind {
            FlowKind::Mice => self.concurrency.mice,
            FlowKind::Elephant => self.concurrency.elephant,
        }
    }

    pub fn note_discarded_arrivals(&mut self, count: u64) {
        self.discarded_arrivals += count;
    }

    pub fn records(&self) -> &[FlowResult] {
        &self.records
    }

    pub fn summary(&self, duration: Duration, cancelled: bool) -> TestSummary {
        let all = self.mice.merged(&self.elephant);
        let seconds = duration.as_secs_f64();
        let aggregate = if seconds > 0.0 {
            all.bytes as f64 * 8.0 / seconds
        } else {
            0.0
        };
        let peak = self.concurrency.peak_total;

        TestSummary {
            test_duration_seconds: seconds,
            mice_flows: self.mice.type_summary(),
            elephant_flows: self.elephant.type_summary(),
            total_flows: all.total,
            successful_flows: all.successful,
            failed_flows: all.total - all.successful,
            success_rate_pct: success_rate(all.successful, all.total),
            total_bytes: all.bytes,
            aggregate_throughput_bps: aggregate,
            average_throughput_bps: mean(all.bps_sum, all.successful),
            average_per_flow_throughput_bps: if peak > 0 {
                aggregate / peak as f64
            } else {
                0.0
            },
            total_retransmits: all.retransmits,
            average_jitter_ms: mean(all.jitter_sum, all.jitter_samples),
            packet_loss_pct: if all.total_packets > 0 {
                all.lost_packets as f64 / all.total_packets as f64 * 100.0
            } else {
                0.0
            },
            peak_concurrent_flows: peak,
            peak_concurrent_mice: self.concurrency.peak_mice,
            peak_concurrent_elephant: self.concurrency.peak_elephant,
            mice_arrivals_discarded: self.discarded_arrivals,
            failures: self.failures.clone(),
            cancelled,
        }
    }

    /// Final summary plus every raw per-flow record, in recording order.
    pub fn finish(self, duration: Duration, cancelled: bool) -> (TestSummary, Vec<FlowResult>) {
        let summary = self.summary(duration, cancelled);
        (summary, self.records)
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { sum / count as f64 }
}
