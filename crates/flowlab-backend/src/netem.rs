use crate::command::{self, args};
use async_trait::async_trait;
use flowlab_abstract::{
    BandwidthConfig, EnvironmentError, EnvironmentStatus, NetworkEnvironment,
    NetworkEnvironmentController,
};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const TC: &str = "tc";
const DEFAULT_BURST: &str = "32kbit";

/// Linux traffic control: an HTB root class for rate limiting with a netem
/// qdisc underneath for delay, loss, corruption, duplication and reordering.
pub struct NetemController {
    interface: String,
    applied_to: Mutex<Option<String>>,
}

impl NetemController {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            applied_to: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn target<'a>(&'a self, env: &'a NetworkEnvironment) -> &'a str {
        env.interface
            .as_deref()
            .filter(|iface| !iface.is_empty())
            .unwrap_or(&self.interface)
    }

    fn remember(&self, interface: Option<String>) {
        if let Ok(mut applied) = self.applied_to.lock() {
            *applied = interface;
        }
    }

    async fn clear_interface(&self, interface: &str) -> Result<(), EnvironmentError> {
        let del = args(["qdisc", "del", "dev", interface, "root"]);
        let output = command::run(TC, &del).await?;
        if output.success || no_qdisc_installed(&output.stderr) {
            return Ok(());
        }
        Err(command::failure(command::render(TC, &del), output))
    }
}

fn no_qdisc_installed(stderr: &str) -> bool {
    stderr.contains("No such file")
        || stderr.contains("Cannot delete qdisc with handle of zero")
}

/// netem options for `env`, e.g. `delay 50ms 20ms 25% loss 0.5%`.
pub fn netem_args(env: &NetworkEnvironment) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    let latency = &env.latency;
    if latency.delay_ms > 0.0 {
        out.extend(["delay".into(), format!("{}ms", latency.delay_ms)]);
        if latency.jitter_ms > 0.0 {
            out.push(format!("{}ms", latency.jitter_ms));
            if latency.correlation_pct > 0.0 {
                out.push(format!("{}%", latency.correlation_pct));
            }
            if !latency.distribution.is_empty() && latency.distribution != "normal" {
                out.extend(["distribution".into(), latency.distribution.clone()]);
            }
        }
    }

    let loss = &env.packet_loss;
    if loss.loss_pct > 0.0 {
        out.extend(["loss".into(), format!("{}%", loss.loss_pct)]);
        if loss.correlation_pct > 0.0 {
            out.push(format!("{}%", loss.correlation_pct));
        }
    } else if loss.p13 > 0.0 {
        out.extend([
            "loss".into(),
            "state".into(),
            format!("{}%", loss.p13),
            format!("{}%", loss.p31),
            format!("{}%", loss.p32),
            format!("{}%", loss.p14),
        ]);
    }

    for (keyword, pct, correlation) in [
        ("corrupt", env.corruption.corrupt_pct, env.corruption.correlation_pct),
        ("duplicate", env.duplication.duplicate_pct, env.duplication.correlation_pct),
        ("reorder", env.reordering.reorder_pct, env.reordering.correlation_pct),
    ] {
        if pct > 0.0 {
            out.extend([keyword.to_string(), format!("{pct}%")]);
            if correlation > 0.0 {
                out.push(format!("{correlation}%"));
            }
        }
    }
    if env.reordering.reorder_pct > 0.0 && env.reordering.gap > 0 {
        out.extend(["gap".into(), env.reordering.gap.to_string()]);
    }

    if env.bandwidth.limit > 0 && !out.is_empty() {
        out.extend(["limit".into(), env.bandwidth.limit.to_string()]);
    }
    out
}

/// HTB root qdisc plus the rate-limited class netem hangs off.
pub fn htb_args(interface: &str, bandwidth: &BandwidthConfig) -> Option<[Vec<String>; 2]> {
    let rate = bandwidth.rate()?;
    let burst = match bandwidth.burst.trim() {
        "" => DEFAULT_BURST,
        burst => burst,
    };
    Some([
        args(["qdisc", "add", "dev", interface, "root", "handle", "1:", "htb", "default", "1"]),
        args([
            "class", "add", "dev", interface, "parent", "1:", "classid", "1:1", "htb", "rate",
            rate, "burst", burst,
        ]),
    ])
}

/// Every `tc` invocation needed to impose `env` on `interface`, in order.
pub fn apply_commands(interface: &str, env: &NetworkEnvironment) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    let shaped = match htb_args(interface, &env.bandwidth) {
        Some(htb) => {
            commands.extend(htb);
            true
        }
        None => false,
    };

    let netem = netem_args(env);
    if !netem.is_empty() {
        let mut qdisc = if shaped {
            args(["qdisc", "add", "dev", interface, "parent", "1:1", "handle", "10:", "netem"])
        } else {
            args(["qdisc", "add", "dev", interface, "root", "handle", "1:", "netem"])
        };
        qdisc.extend(netem);
        commands.push(qdisc);
    }
    commands
}

#[async_trait]
impl NetworkEnvironmentController for NetemController {
    fn name(&self) -> &'static str {
        "netem"
    }

    async fn apply(&self, env: &NetworkEnvironment) -> Result<(), EnvironmentError> {
        let interface = self.target(env).to_string();
        self.clear_interface(&interface).await?;

        let commands = apply_commands(&interface, env);
        if commands.is_empty() {
            debug!(environment = %env.name, "environment is neutral, nothing to apply");
            return Ok(());
        }

        self.remember(Some(interface.clone()));
        for tc_args in &commands {
            if let Err(err) = command::run_checked(TC, tc_args).await {
                // roll back whatever was installed
                if let Err(cleanup) = self.clear_interface(&interface).await {
                    warn!(%interface, error = %cleanup, "rollback after failed apply also failed");
                }
                self.remember(None);
                return Err(err);
            }
        }
        info!(environment = %env.name, %interface, "network environment applied");
        Ok(())
    }

    async fn clear(&self) -> Result<(), EnvironmentError> {
        let interface = self
            .applied_to
            .lock()
            .ok()
            .and_then(|mut applied| applied.take())
            .unwrap_or_else(|| self.interface.clone());
        self.clear_interface(&interface).await?;
        debug!(%interface, "network environment cleared");
        Ok(())
    }

    async fn status(&self) -> Result<EnvironmentStatus, EnvironmentError> {
        let mut details = Vec::new();
        for object in ["qdisc", "class", "filter"] {
            let output = command::run(TC, &args([object, "show", "dev", self.interface.as_str()])).await?;
            details.extend(output.lines().into_iter().map(|line| format!("{object}: {line}")));
        }
        let active = details
            .iter()
            .any(|line| line.contains("netem") || line.contains("htb"));
        Ok(EnvironmentStatus {
            controller: self.name().to_string(),
            interface: Some(self.interface.clone()),
            active,
            details,
        })
    }
}
