use crate::sweep::SweepResult;
use flowlab_abstract::{AggregationError, ConfigError, EnvironmentError};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid test profile")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Where in a sweep point the conditioning backend failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentPhase {
    Apply,
    Clear,
}

impl fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentPhase::Apply => f.write_str("apply"),
            EnvironmentPhase::Clear => f.write_str("clear"),
        }
    }
}

/// A sweep stopped early. Every point completed before the failure is kept in `partial`.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid scenario")]
    Config(#[from] ConfigError),
    #[error("failed to {phase} network environment at {client_count} clients")]
    Environment {
        client_count: u32,
        phase: EnvironmentPhase,
        #[source]
        source: EnvironmentError,
        partial: Box<SweepResult>,
    },
    #[error("result aggregation failed at {client_count} clients")]
    Aggregation {
        client_count: u32,
        #[source]
        source: AggregationError,
        partial: Box<SweepResult>,
    },
}

impl SweepError {
    pub fn partial(&self) -> Option<&SweepResult> {
        match self {
            SweepError::Config(_) => None,
            SweepError::Environment { partial, .. } | SweepError::Aggregation { partial, .. } => {
                Some(partial)
            }
        }
    }

    pub fn into_partial(self) -> Option<SweepResult> {
        match self {
            SweepError::Config(_) => None,
            SweepError::Environment { partial, .. } | SweepError::Aggregation { partial, .. } => {
                Some(*partial)
            }
        }
    }
}
