use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type FlowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    /// Short, small-payload transfer.
    Mice,
    /// Long, sustained, bandwidth-bound transfer.
    Elephant,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Mice => f.write_str("mice"),
            FlowKind::Elephant => f.write_str("elephant"),
        }
    }
}

/// A single unit of work handed to a [`crate::FlowRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub id: FlowId,
    pub kind: FlowKind,
    /// Target port on the remote endpoint.
    pub port: u16,
    /// Bytes to move. Only mice flows are size-bounded.
    pub size_bytes: Option<u64>,
    /// Sampled duration for mice, remaining test time for elephants.
    pub duration: Duration,
    /// Rate cap passed through to the backend (e.g. "100M").
    pub bandwidth: Option<String>,
    /// Offset from the start of the run at which the flow was dispatched.
    pub scheduled_at: Duration,
}

impl Flow {
    /// Upper bound a runner should allow this flow before giving up on it.
    pub fn timeout(&self, margin: Duration) -> Duration {
        self.duration.saturating_add(margin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Refused,
    Timeout,
    PartialTransfer,
    ProtocolError,
    NonZeroExit,
    NoPortAvailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Refused => "refused",
            FailureKind::Timeout => "timeout",
            FailureKind::PartialTransfer => "partial transfer",
            FailureKind::ProtocolError => "protocol error",
            FailureKind::NonZeroExit => "non-zero exit",
            FailureKind::NoPortAvailable => "no port available",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FlowFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FlowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of exactly one [`Flow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow_id: FlowId,
    pub kind: FlowKind,
    pub port: u16,
    /// Seconds since the start of the run.
    pub started_at: f64,
    pub finished_at: f64,
    pub bytes_transferred: u64,
    pub bits_per_second: f64,
    pub retransmits: u64,
    /// UDP only.
    pub jitter_ms: Option<f64>,
    pub lost_packets: u64,
    pub total_packets: u64,
    pub success: bool,
    pub failure: Option<FlowFailure>,
}

impl FlowResult {
    pub fn completed(flow: &Flow, bytes_transferred: u64, bits_per_second: f64) -> Self {
        Self {
            flow_id: flow.id,
            kind: flow.kind,
            port: flow.port,
            started_at: flow.scheduled_at.as_secs_f64(),
            finished_at: flow.scheduled_at.as_secs_f64(),
            bytes_transferred,
            bits_per_second,
            retransmits: 0,
            jitter_ms: None,
            lost_packets: 0,
            total_packets: 0,
            success: true,
            failure: None,
        }
    }

    pub fn failed(flow: &Flow, failure: FlowFailure) -> Self {
        Self {
            success: false,
            failure: Some(failure),
            ..Self::completed(flow, 0, 0.0)
        }
    }

    pub fn with_retransmits(mut self, retransmits: u64) -> Self {
        self.retransmits = retransmits;
        self
    }

    pub fn with_datagram_stats(mut self, jitter_ms: f64, lost_packets: u64, total_packets: u64) -> Self {
        self.jitter_ms = Some(jitter_ms);
        self.lost_packets = lost_packets;
        self.total_packets = total_packets;
        self
    }

    /// Datagram loss in percent; `None` for stream transfers.
    pub fn loss_pct(&self) -> Option<f64> {
        (self.total_packets > 0)
            .then(|| self.lost_packets as f64 / self.total_packets as f64 * 100.0)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mice_flow() -> Flow {
        Flow {
            id: 7,
            kind: FlowKind::Mice,
            port: 5203,
            size_bytes: Some(4096),
            duration: Duration::from_millis(250),
            bandwidth: None,
            scheduled_at: Duration::from_secs(2),
        }
    }

    #[test]
    fn failed_result_carries_flow_identity() {
        let flow = mice_flow();
        let result = FlowResult::failed(&flow, FlowFailure::new(FailureKind::Refused, "connection refused"));
        assert_eq!(result.flow_id, 7);
        assert_eq!(result.port, 5203);
        assert!(!result.success);
        assert_eq!(result.bytes_transferred, 0);
        assert_eq!(result.failure_kind(), Some(FailureKind::Refused));
        assert_eq!(result.started_at, 2.0);
    }

    #[test]
    fn loss_is_only_reported_for_datagram_flows() {
        let flow = mice_flow();
        let tcp = FlowResult::completed(&flow, 4096, 1e6);
        assert_eq!(tcp.loss_pct(), None);

        let udp = FlowResult::completed(&flow, 4096, 1e6).with_datagram_stats(0.4, 5, 200);
        assert_eq!(udp.loss_pct(), Some(2.5));
    }

    #[test]
    fn timeout_adds_margin_to_duration() {
        let flow = mice_flow();
        assert_eq!(flow.timeout(Duration::from_secs(30)), Duration::from_millis(30_250));
    }
}
