use crate::flow::FlowId;
use thiserror::Error;

/// Invalid profile or scenario, rejected before any flow is scheduled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("test duration must be positive, got {0}s")]
    NonPositiveDuration(f64),
    #[error("{field}: range [{min}, {max}] is empty or inverted")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("{field} must be a finite, non-negative number, got {value}")]
    InvalidNumber { field: &'static str, value: f64 },
    #[error("{field} of {value}s cannot be scheduled")]
    DurationOutOfRange { field: &'static str, value: f64 },
    #[error("invalid bandwidth '{0}' (expected e.g. \"100M\", \"25mbit\", \"500k\")")]
    InvalidBandwidth(String),
    #[error("scenario lists no client counts")]
    NoClientCounts,
    #[error("client counts must be at least 1")]
    ZeroClients,
    #[error("port range starting at {base} with {count} ports exceeds 65535")]
    PortRangeOverflow { base: u16, count: u16 },
}

/// Collector bookkeeping violated. Always a programming defect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("result reported for unknown flow {0}")]
    UnknownFlow(FlowId),
    #[error("flow {0} reported more than one result")]
    DuplicateResult(FlowId),
}

/// A conditioning backend failed to apply, clear or inspect conditions.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("{controller} cannot emulate this environment: {reason}")]
    Unsupported {
        controller: &'static str,
        reason: String,
    },
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` requires root privileges")]
    MissingPrivileges(String),
    #[error("failed to stage conditioning rules")]
    Io(#[from] std::io::Error),
}
