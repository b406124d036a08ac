//! Fake collaborators shared by the engine's unit tests.

use async_trait::async_trait;
use flowlab_abstract::{
    EnvironmentError, EnvironmentStatus, FailureKind, Flow, FlowFailure, FlowKind, FlowResult,
    FlowRunner, NetworkEnvironment, NetworkEnvironmentController,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    Fail(FailureKind),
    Hang,
    WrongId,
    Panic,
}

/// Sleeps for the flow's duration (or a fixed hold) and answers per its script.
/// Successful flows move exactly `size_bytes` (1 MB for elephants).
pub struct ScriptedRunner {
    script: Script,
    hold: Option<Duration>,
    mice_calls: AtomicU64,
    elephant_calls: AtomicU64,
    active_mice: AtomicU64,
    peak_mice: AtomicU64,
}

struct ActiveGuard<'a>(&'a AtomicU64);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            hold: None,
            mice_calls: AtomicU64::new(0),
            elephant_calls: AtomicU64::new(0),
            active_mice: AtomicU64::new(0),
            peak_mice: AtomicU64::new(0),
        }
    }

    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn calls(&self, kind: FlowKind) -> u64 {
        match kind {
            FlowKind::Mice => self.mice_calls.load(Ordering::SeqCst),
            FlowKind::Elephant => self.elephant_calls.load(Ordering::SeqCst),
        }
    }

    pub fn peak_mice(&self) -> u64 {
        self.peak_mice.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowRunner for ScriptedRunner {
    async fn execute(&self, flow: Flow) -> FlowResult {
        let _guard = match flow.kind {
            FlowKind::Mice => {
                self.mice_calls.fetch_add(1, Ordering::SeqCst);
                let active = self.active_mice.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_mice.fetch_max(active, Ordering::SeqCst);
                Some(ActiveGuard(&self.active_mice))
            }
            FlowKind::Elephant => {
                self.elephant_calls.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        match self.script {
            Script::Hang => std::future::pending::<()>().await,
            Script::Panic => panic!("scripted runner panic for flow {}", flow.id),
            _ => {}
        }
        tokio::time::sleep(self.hold.unwrap_or(flow.duration)).await;

        let bytes = flow.size_bytes.unwrap_or(1_000_000);
        match self.script {
            Script::Fail(kind) => FlowResult::failed(&flow, FlowFailure::new(kind, "scripted failure")),
            Script::WrongId => FlowResult {
                flow_id: flow.id + 10_000,
                ..FlowResult::completed(&flow, bytes, 8e6)
            },
            _ => FlowResult::completed(&flow, bytes, 8e6),
        }
    }
}

/// Logs every call as `apply:<name>`, `clear` or `status`; can fail on chosen calls.
#[derive(Default)]
pub struct RecordingController {
    calls: Mutex<Vec<String>>,
    fail_apply_at: Option<usize>,
    fail_clear_at: Option<usize>,
    applies: AtomicU64,
    clears: AtomicU64,
}

impl RecordingController {
    /// Fail the `n`th (1-based) call to `apply`.
    pub fn failing_apply(n: usize) -> Self {
        Self {
            fail_apply_at: Some(n),
            ..Default::default()
        }
    }

    /// Fail the `n`th (1-based) call to `clear`.
    pub fn failing_clear(n: usize) -> Self {
        Self {
            fail_clear_at: Some(n),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn failure(command: &str) -> EnvironmentError {
        EnvironmentError::CommandFailed {
            command: command.to_string(),
            status: "exit status: 2".to_string(),
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        }
    }
}

#[async_trait]
impl NetworkEnvironmentController for RecordingController {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn apply(&self, env: &NetworkEnvironment) -> Result<(), EnvironmentError> {
        self.calls.lock().unwrap().push(format!("apply:{}", env.name));
        let n = self.applies.fetch_add(1, Ordering::SeqCst) as usize + 1;
        if self.fail_apply_at == Some(n) {
            return Err(Self::failure("tc qdisc add"));
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), EnvironmentError> {
        self.calls.lock().unwrap().push("clear".to_string());
        let n = self.clears.fetch_add(1, Ordering::SeqCst) as usize + 1;
        if self.fail_clear_at == Some(n) {
            return Err(Self::failure("tc qdisc del"));
        }
        Ok(())
    }

    async fn status(&self) -> Result<EnvironmentStatus, EnvironmentError> {
        self.calls.lock().unwrap().push("status".to_string());
        Ok(EnvironmentStatus {
            controller: self.name().to_string(),
            interface: None,
            active: false,
            details: Vec::new(),
        })
    }
}
