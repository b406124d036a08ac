use async_trait::async_trait;
use flowlab_abstract::{FailureKind, Flow, FlowFailure, FlowKind, FlowResult, FlowRunner};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Runs each flow as an `iperf3 -J` client against a remote server.
#[derive(Debug, Clone)]
pub struct Iperf3Runner {
    host: String,
    binary: String,
    timeout_margin: Duration,
}

impl Iperf3Runner {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            binary: "iperf3".to_string(),
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn client_args(&self, flow: &Flow) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.host.clone(),
            "-p".to_string(),
            flow.port.to_string(),
            "-J".to_string(),
        ];
        match flow.kind {
            FlowKind::Mice => {
                if let Some(size) = flow.size_bytes {
                    args.extend(["-n".to_string(), size.to_string()]);
                }
            }
            FlowKind::Elephant => {
                let secs = flow.duration.as_secs_f64().ceil().max(1.0) as u64;
                args.extend(["-t".to_string(), secs.to_string()]);
                if let Some(bandwidth) = &flow.bandwidth {
                    args.extend(["-b".to_string(), bandwidth.clone()]);
                }
            }
        }
        args
    }
}

#[async_trait]
impl FlowRunner for Iperf3Runner {
    async fn execute(&self, flow: Flow) -> FlowResult {
        let args = self.client_args(&flow);
        trace!(flow = flow.id, ?args, "spawning iperf3");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return FlowResult::failed(
                    &flow,
                    FlowFailure::new(
                        FailureKind::ProtocolError,
                        format!("failed to spawn {}: {err}", self.binary),
                    ),
                );
            }
        };

        let limit = flow.timeout(self.timeout_margin);
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return FlowResult::failed(
                    &flow,
                    FlowFailure::new(FailureKind::ProtocolError, err.to_string()),
                );
            }
            Err(_) => {
                debug!(flow = flow.id, ?limit, "iperf3 exceeded its time limit");
                return FlowResult::failed(
                    &flow,
                    FlowFailure::new(
                        FailureKind::Timeout,
                        format!("no result after {:.1}s", limit.as_secs_f64()),
                    ),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("iperf3 exited with {}", output.status)
            } else {
                stderr
            };
            return FlowResult::failed(&flow, FlowFailure::new(FailureKind::NonZeroExit, message));
        }
        parse_iperf3_output(&flow, &stdout)
    }
}

pub fn classify_error(message: &str) -> FailureKind {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("refused") {
        FailureKind::Refused
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        FailureKind::Timeout
    } else {
        FailureKind::ProtocolError
    }
}

fn field_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0)
}

fn field_f64(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Map an `iperf3 -J` report onto a [`FlowResult`] for `flow`.
pub fn parse_iperf3_output(flow: &Flow, output: &str) -> FlowResult {
    let data: Value = match serde_json::from_str(output) {
        Ok(data) => data,
        Err(err) => {
            return FlowResult::failed(
                flow,
                FlowFailure::new(FailureKind::ProtocolError, format!("invalid iperf3 json: {err}")),
            );
        }
    };

    if let Some(error) = data.get("error").and_then(Value::as_str) {
        return FlowResult::failed(flow, FlowFailure::new(classify_error(error), error));
    }

    let end = &data["end"];
    let result = if let Some(sent) = end.get("sum_sent") {
        FlowResult::completed(flow, field_u64(sent, "bytes"), field_f64(sent, "bits_per_second"))
            .with_retransmits(field_u64(sent, "retransmits"))
    } else if let Some(sum) = end.get("sum") {
        FlowResult::completed(flow, field_u64(sum, "bytes"), field_f64(sum, "bits_per_second"))
            .with_datagram_stats(
                field_f64(sum, "jitter_ms"),
                field_u64(sum, "lost_packets"),
                field_u64(sum, "packets"),
            )
    } else if let Some(stream) = end["streams"]
        .get(0)
        .and_then(|s| s.get("sender").or_else(|| s.get("udp")))
    {
        let result = FlowResult::completed(
            flow,
            field_u64(stream, "bytes"),
            field_f64(stream, "bits_per_second"),
        )
        .with_retransmits(field_u64(stream, "retransmits"));
        if stream.get("jitter_ms").is_some() {
            result.with_datagram_stats(
                field_f64(stream, "jitter_ms"),
                field_u64(stream, "lost_packets"),
                field_u64(stream, "packets"),
            )
        } else {
            result
        }
    } else {
        return FlowResult::failed(
            flow,
            FlowFailure::new(FailureKind::ProtocolError, "iperf3 report has no summary"),
        );
    };

    match flow.size_bytes {
        Some(requested) if flow.kind == FlowKind::Mice && result.bytes_transferred < requested => {
            let moved = result.bytes_transferred;
            FlowResult {
                success: false,
                failure: Some(FlowFailure::new(
                    FailureKind::PartialTransfer,
                    format!("moved {moved} of {requested} bytes"),
                )),
                ..result
            }
        }
        _ => result,
    }
}
