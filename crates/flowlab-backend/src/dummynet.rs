use crate::command::{self, args};
use async_trait::async_trait;
use flowlab_abstract::{
    EnvironmentError, EnvironmentStatus, NetworkEnvironment, NetworkEnvironmentController,
};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

const DNCTL: &str = "dnctl";
const PFCTL: &str = "pfctl";

/// macOS conditioning through a dummynet pipe, fed by rules loaded into a
/// dedicated pf anchor. pf applies host-wide, so the interface is informational.
pub struct DummynetController {
    interface: String,
    pipe: u32,
    anchor: String,
    rules_file: Mutex<Option<PathBuf>>,
}

impl DummynetController {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            pipe: 1,
            anchor: "flowlab".to_string(),
            rules_file: Mutex::new(None),
        }
    }

    fn forget_rules_file(&self) {
        let path = self.rules_file.lock().ok().and_then(|mut file| file.take());
        if let Some(path) = path
            && let Err(err) = std::fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %err, "could not remove staged pf rules");
        }
    }
}

/// Translate a tc-style rate (`25mbit`) into dummynet's notation (`25Mbit/s`).
fn dummynet_rate(rate: &str) -> String {
    let rate = rate.to_ascii_lowercase();
    for (suffix, unit) in [("gbit", "Gbit/s"), ("mbit", "Mbit/s"), ("kbit", "Kbit/s")] {
        if let Some(value) = rate.strip_suffix(suffix) {
            return format!("{value}{unit}");
        }
    }
    rate
}

pub fn dummynet_pipe_args(env: &NetworkEnvironment) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(rate) = env.bandwidth.rate() {
        out.extend(["bw".to_string(), dummynet_rate(rate)]);
    }
    if env.latency.delay_ms > 0.0 {
        out.extend(["delay".to_string(), format!("{:.3}ms", env.latency.delay_ms)]);
    }
    if env.packet_loss.loss_pct > 0.0 {
        out.extend(["plr".to_string(), (env.packet_loss.loss_pct / 100.0).to_string()]);
    }
    if env.bandwidth.limit > 0 {
        out.extend(["queue".to_string(), env.bandwidth.limit.to_string()]);
    }
    out
}

pub fn pf_anchor_rules(env: &NetworkEnvironment, pipe: u32) -> Vec<String> {
    if env.target_ips.is_empty() {
        return vec![
            format!("dummynet out all pipe {pipe}"),
            format!("dummynet in all pipe {pipe}"),
        ];
    }
    env.target_ips
        .iter()
        .flat_map(|ip| {
            [
                format!("dummynet out to {ip} pipe {pipe}"),
                format!("dummynet in from {ip} pipe {pipe}"),
            ]
        })
        .collect()
}

/// Conditions dummynet cannot express; they are dropped with a warning.
fn unsupported_conditions(env: &NetworkEnvironment) -> Vec<&'static str> {
    let mut dropped = Vec::new();
    if env.latency.jitter_ms > 0.0 {
        dropped.push("jitter");
    }
    if env.packet_loss.loss_pct <= 0.0 && env.packet_loss.p13 > 0.0 {
        dropped.push("burst loss");
    }
    if env.corruption.corrupt_pct > 0.0 {
        dropped.push("corruption");
    }
    if env.duplication.duplicate_pct > 0.0 {
        dropped.push("duplication");
    }
    if env.reordering.reorder_pct > 0.0 {
        dropped.push("reordering");
    }
    dropped
}

#[async_trait]
impl NetworkEnvironmentController for DummynetController {
    fn name(&self) -> &'static str {
        "dummynet"
    }

    async fn apply(&self, env: &NetworkEnvironment) -> Result<(), EnvironmentError> {
        self.clear().await?;

        let pipe_args = dummynet_pipe_args(env);
        if pipe_args.is_empty() {
            return Err(EnvironmentError::Unsupported {
                controller: self.name(),
                reason: format!("environment {} has no condition dummynet can apply", env.name),
            });
        }
        let dropped = unsupported_conditions(env);
        if !dropped.is_empty() {
            warn!(environment = %env.name, ?dropped, "dummynet ignores these conditions");
        }

        let mut config = args(["pipe", &self.pipe.to_string(), "config"]);
        config.extend(pipe_args);
        command::run_checked(DNCTL, &config).await?;

        let rules = pf_anchor_rules(env, self.pipe);
        let path = std::env::temp_dir().join(format!("flowlab_pf_{}.conf", std::process::id()));
        let mut body = format!("anchor \"{}\" {{\n", self.anchor);
        for rule in &rules {
            body.push_str(&format!("    {rule}\n"));
        }
        body.push_str("}\n");
        tokio::fs::write(&path, body).await?;
        if let Ok(mut file) = self.rules_file.lock() {
            *file = Some(path.clone());
        }

        // exits non-zero when pf is already enabled
        command::run(PFCTL, &args(["-e"])).await?;
        let load = vec![
            "-a".to_string(),
            self.anchor.clone(),
            "-f".to_string(),
            path.display().to_string(),
        ];
        if let Err(err) = command::run_checked(PFCTL, &load).await {
            if let Err(cleanup) = self.clear().await {
                warn!(error = %cleanup, "rollback after failed apply also failed");
            }
            return Err(err);
        }

        info!(
            environment = %env.name,
            interface = %self.interface,
            rules = rules.len(),
            "network environment applied host-wide"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), EnvironmentError> {
        command::run(PFCTL, &args(["-a", &self.anchor, "-F", "all"])).await?;
        command::run(DNCTL, &args(["pipe", &self.pipe.to_string(), "delete"])).await?;
        self.forget_rules_file();
        Ok(())
    }

    async fn status(&self) -> Result<EnvironmentStatus, EnvironmentError> {
        let pipes = command::run(DNCTL, &args(["pipe", "show"])).await?.lines();
        let rules = command::run(PFCTL, &args(["-a", &self.anchor, "-s", "rules"]))
            .await?
            .lines();
        let active = rules.iter().any(|rule| rule.contains("dummynet"));
        let details = pipes
            .into_iter()
            .map(|line| format!("pipe: {line}"))
            .chain(rules.into_iter().map(|line| format!("rule: {line}")))
            .collect();
        Ok(EnvironmentStatus {
            controller: self.name().to_string(),
            interface: Some(self.interface.clone()),
            active,
            details,
        })
    }
}
