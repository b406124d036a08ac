use crate::environment::{EnvironmentStatus, NetworkEnvironment};
use crate::error::EnvironmentError;
use crate::flow::{Flow, FlowResult};
use async_trait::async_trait;

/// Executes the transfer described by a [`Flow`].
///
/// Called concurrently from many tasks, so implementations must not share mutable
/// state between invocations. A runner never blocks indefinitely: it owns a timeout
/// derived from the flow's duration plus a fixed margin, and reports every failure
/// as a classified [`FlowResult`] rather than an error.
#[async_trait]
pub trait FlowRunner: Send + Sync {
    async fn execute(&self, flow: Flow) -> FlowResult;
}

/// Imposes and removes link conditions around a test run.
///
/// Concrete backends are chosen once at startup; callers never branch on platform.
#[async_trait]
pub trait NetworkEnvironmentController: Send + Sync {
    /// Short backend name used in logs and status output.
    fn name(&self) -> &'static str;

    async fn apply(&self, env: &NetworkEnvironment) -> Result<(), EnvironmentError>;

    async fn clear(&self) -> Result<(), EnvironmentError>;

    async fn status(&self) -> Result<EnvironmentStatus, EnvironmentError>;
}
