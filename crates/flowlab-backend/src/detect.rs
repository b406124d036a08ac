use crate::command::{self, args};
use crate::dummynet::DummynetController;
use crate::netem::NetemController;
use crate::noop::NoopController;
use flowlab_abstract::NetworkEnvironmentController;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Netem,
    Dummynet,
    Unavailable(String),
}

/// Pick a conditioning backend for `os` given which binaries are installed.
pub fn select_backend(os: &str, has: impl Fn(&str) -> bool) -> Backend {
    match os {
        "linux" if has("tc") => Backend::Netem,
        "linux" => Backend::Unavailable("tc not found on PATH (install iproute2)".to_string()),
        "macos" => match ["dnctl", "pfctl"].into_iter().find(|binary| !has(*binary)) {
            None => Backend::Dummynet,
            Some(missing) => Backend::Unavailable(format!("{missing} not found on PATH")),
        },
        other => Backend::Unavailable(format!("no conditioning backend for {other}")),
    }
}

/// Interface named after `dev` in `ip route show default`.
pub fn parse_linux_default_route(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    tokens.find(|token| *token == "dev")?;
    tokens.next().map(str::to_string)
}

/// Interface from the `interface:` line of `route -n get default`.
pub fn parse_macos_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("interface:"))
        .map(str::trim)
        .find(|iface| !iface.is_empty())
        .map(str::to_string)
}

pub async fn default_interface() -> Option<String> {
    match std::env::consts::OS {
        "macos" => command::run("route", &args(["-n", "get", "default"]))
            .await
            .ok()
            .filter(|output| output.success)
            .and_then(|output| parse_macos_default_route(&output.stdout)),
        _ => command::run("ip", &args(["route", "show", "default"]))
            .await
            .ok()
            .filter(|output| output.success)
            .and_then(|output| parse_linux_default_route(&output.stdout)),
    }
}

/// Choose the controller for this host once, at startup.
pub async fn detect_controller(interface: Option<String>) -> Arc<dyn NetworkEnvironmentController> {
    let backend = select_backend(std::env::consts::OS, |binary| command::which(binary).is_some());
    let interface = match interface {
        Some(interface) => Some(interface),
        None => default_interface().await,
    };

    match (backend, interface) {
        (Backend::Unavailable(reason), _) => {
            warn!(%reason, "network conditioning unavailable");
            Arc::new(NoopController::because(reason))
        }
        (_, None) => {
            warn!("could not determine the default network interface");
            Arc::new(NoopController::because(
                "no network interface (pass --interface)",
            ))
        }
        (Backend::Netem, Some(interface)) => {
            info!(%interface, "using tc/netem");
            Arc::new(NetemController::new(interface))
        }
        (Backend::Dummynet, Some(interface)) => {
            info!(%interface, "using dummynet/pf");
            Arc::new(DummynetController::new(interface))
        }
    }
}
