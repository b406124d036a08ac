use async_trait::async_trait;
use flowlab_abstract::{
    EnvironmentError, EnvironmentStatus, NetworkEnvironment, NetworkEnvironmentController,
};
use tracing::debug;

/// Controller for hosts with no conditioning backend. Neutral environments
/// are accepted; anything else is refused.
#[derive(Debug, Default)]
pub struct NoopController {
    reason: Option<String>,
}

impl NoopController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explain why no real backend was chosen, surfaced when apply is refused.
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
impl NetworkEnvironmentController for NoopController {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn apply(&self, env: &NetworkEnvironment) -> Result<(), EnvironmentError> {
        if env.is_neutral() {
            debug!(environment = %env.name, "neutral environment, nothing to do");
            return Ok(());
        }
        let reason = match &self.reason {
            Some(reason) => format!("cannot apply {}: {reason}", env.name),
            None => format!("cannot apply {}: no conditioning backend", env.name),
        };
        Err(EnvironmentError::Unsupported {
            controller: self.name(),
            reason,
        })
    }

    async fn clear(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn status(&self) -> Result<EnvironmentStatus, EnvironmentError> {
        Ok(EnvironmentStatus {
            controller: self.name().to_string(),
            interface: None,
            active: false,
            details: self.reason.iter().cloned().collect(),
        })
    }
}
