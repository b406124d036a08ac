use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use flowlab_abstract::abort_pair;

mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mice/elephant traffic generator and scaling sweeps")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one traffic profile against an iperf3 server.
    Run(RunArgs),
    /// Run a scenario once per client count and analyze the results.
    Sweep(SweepArgs),
    /// Re-analyze a saved sweep report.
    Analyze {
        report: PathBuf,
        /// Success rate (percent) below which a point counts as broken.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Export a saved sweep report as CSV.
    ExportCsv { report: PathBuf, output: PathBuf },
    /// List the built-in network environments.
    Presets,
    /// Show what the conditioning backend currently has installed.
    EnvStatus {
        #[arg(long)]
        interface: Option<String>,
    },
    /// Serve a range of ports with one-off iperf3 servers until interrupted.
    Server {
        #[arg(long, default_value_t = 5201)]
        base_port: u16,
        /// Number of ports, starting at --base-port.
        #[arg(long, default_value_t = 50)]
        ports: u16,
    },
}

/// Options shared by every command that drives traffic.
#[derive(Args, Debug)]
struct TrafficArgs {
    /// iperf3 server host.
    #[arg(long)]
    server: String,

    #[arg(long, default_value_t = 5201)]
    base_port: u16,

    /// Number of server ports, starting at --base-port.
    #[arg(long, default_value_t = 50)]
    ports: u16,

    /// Seconds outstanding flows may overrun the test before timing out.
    #[arg(long, default_value_t = 10.0)]
    grace: f64,

    /// Fixed seed for flow size and duration sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Seconds to wait before replacing a failed elephant flow.
    #[arg(long, default_value_t = 0.0)]
    elephant_backoff: f64,

    /// Seconds iperf3 may run past a flow's nominal duration.
    #[arg(long, default_value_t = 30.0)]
    timeout_margin: f64,

    /// Directory reports are written to.
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    profile: PathBuf,

    /// Override the profile's duration, in seconds.
    #[arg(long)]
    duration: Option<f64>,

    #[command(flatten)]
    traffic: TrafficArgs,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[arg(long)]
    scenario: PathBuf,

    /// Comma-separated client counts, e.g. 10,20,30.
    #[arg(long, value_delimiter = ',')]
    clients: Option<Vec<u32>>,

    /// Override the delay between points, in seconds.
    #[arg(long)]
    delay: Option<f64>,

    /// Override each point's duration, in seconds.
    #[arg(long)]
    duration: Option<f64>,

    /// Apply a built-in network environment.
    #[arg(long, conflicts_with = "environment")]
    preset: Option<String>,

    /// Apply a network environment loaded from TOML.
    #[arg(long)]
    environment: Option<PathBuf>,

    /// Interface to condition. Defaults to the one carrying the default route.
    #[arg(long)]
    interface: Option<String>,

    /// Ignore any environment named by the scenario.
    #[arg(long, default_value_t = false, conflicts_with_all = ["preset", "environment"])]
    no_environment: bool,

    #[command(flatten)]
    traffic: TrafficArgs,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (handle, abort) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current flows");
            handle.abort();
        }
    });

    match cli.command {
        Command::Run(args) => commands::run(args, abort).await,
        Command::Sweep(args) => commands::sweep(args, abort).await,
        Command::Analyze { report, threshold } => commands::analyze_report(&report, threshold),
        Command::ExportCsv { report, output } => commands::export_csv(&report, &output),
        Command::Presets => {
            commands::presets();
            Ok(())
        }
        Command::EnvStatus { interface } => commands::env_status(interface).await,
        Command::Server { base_port, ports } => commands::server(base_port, ports, abort).await,
    }
}
