use flowlab_abstract::{AbortSignal, ConfigError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause before retrying a port whose server could not be spawned.
pub const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One `iperf3 -s -1` per port, restarted after every session it serves.
#[derive(Debug, Clone)]
pub struct ServerPool {
    base_port: u16,
    ports: u16,
    binary: String,
    retry_delay: Duration,
}

/// What a pool did before it was stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerPoolStats {
    /// Server processes that exited on their own, one per finished session.
    pub sessions: u64,
    pub spawn_failures: u64,
}

impl ServerPool {
    pub fn new(base_port: u16, ports: u16) -> Result<Self, ConfigError> {
        if ports == 0 {
            return Err(ConfigError::InvalidNumber {
                field: "ports",
                value: 0.0,
            });
        }
        if u32::from(base_port) + u32::from(ports) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::PortRangeOverflow {
                base: base_port,
                count: ports,
            });
        }
        Ok(Self {
            base_port,
            ports,
            binary: "iperf3".to_string(),
            retry_delay: SPAWN_RETRY_DELAY,
        })
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Inclusive first and last port served.
    pub fn port_range(&self) -> (u16, u16) {
        (self.base_port, self.base_port + (self.ports - 1))
    }

    pub fn server_args(port: u16) -> Vec<String> {
        vec![
            "-s".to_string(),
            "-p".to_string(),
            port.to_string(),
            "-1".to_string(),
        ]
    }

    /// Serve every port until `abort` fires, then kill the running servers.
    pub async fn run(&self, abort: AbortSignal) -> ServerPoolStats {
        let (first, last) = self.port_range();
        info!(first, last, servers = self.ports, "starting iperf3 server pool");

        let mut servers = JoinSet::new();
        for port in first..=last {
            let binary = self.binary.clone();
            let retry_delay = self.retry_delay;
            let abort = abort.clone();
            servers.spawn(async move { serve_port(&binary, port, retry_delay, abort).await });
        }

        let mut total = ServerPoolStats::default();
        while let Some(joined) = servers.join_next().await {
            match joined {
                Ok(stats) => {
                    total.sessions += stats.sessions;
                    total.spawn_failures += stats.spawn_failures;
                }
                Err(err) => warn!(error = %err, "server task ended abnormally"),
            }
        }
        info!(
            sessions = total.sessions,
            spawn_failures = total.spawn_failures,
            "server pool stopped"
        );
        total
    }
}

async fn serve_port(
    binary: &str,
    port: u16,
    retry_delay: Duration,
    abort: AbortSignal,
) -> ServerPoolStats {
    let mut stats = ServerPoolStats::default();
    let args = ServerPool::server_args(port);
    while !abort.is_aborted() {
        let child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                stats.spawn_failures += 1;
                warn!(port, error = %err, "failed to start iperf3 server");
                tokio::select! {
                    biased;
                    _ = abort.aborted() => break,
                    _ = tokio::time::sleep(retry_delay) => continue,
                }
            }
        };

        tokio::select! {
            biased;
            _ = abort.aborted() => {
                if let Err(err) = child.kill().await {
                    warn!(port, error = %err, "could not stop iperf3 server");
                }
                break;
            }
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        stats.sessions += 1;
                        debug!(port, %status, "server session ended, restarting");
                    }
                    Err(err) => {
                        warn!(port, error = %err, "lost track of iperf3 server");
                    }
                }
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlab_abstract::abort_pair;

    #[test]
    fn builds_one_off_server_arguments() {
        assert_eq!(ServerPool::server_args(5207).join(" "), "-s -p 5207 -1");

        let pool = ServerPool::new(5201, 50).unwrap();
        assert_eq!(pool.port_range(), (5201, 5250));
    }

    #[test]
    fn rejects_empty_and_overflowing_ranges() {
        assert!(matches!(
            ServerPool::new(5201, 0),
            Err(ConfigError::InvalidNumber { field: "ports", .. })
        ));
        assert!(matches!(
            ServerPool::new(65500, 100),
            Err(ConfigError::PortRangeOverflow { .. })
        ));
        assert_eq!(ServerPool::new(65535, 1).unwrap().port_range(), (65535, 65535));
    }

    #[tokio::test]
    async fn servers_restart_after_each_session() {
        let pool = ServerPool::new(6100, 2).unwrap().with_binary("true");
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.abort();
        });

        let stats = pool.run(signal).await;
        assert!(stats.sessions >= 4, "{stats:?}");
        assert_eq!(stats.spawn_failures, 0);
    }

    #[tokio::test]
    async fn aborted_pool_starts_nothing() {
        let pool = ServerPool::new(6200, 3).unwrap().with_binary("true");
        let (handle, signal) = abort_pair();
        handle.abort();

        let stats = tokio::time::timeout(Duration::from_secs(5), pool.run(signal))
            .await
            .unwrap();
        assert_eq!(stats, ServerPoolStats::default());
    }

    #[tokio::test]
    async fn missing_binary_is_retried_until_abort() {
        let pool = ServerPool::new(6300, 1)
            .unwrap()
            .with_binary("flowlab-no-such-iperf3")
            .with_retry_delay(Duration::from_millis(20));
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            handle.abort();
        });

        let stats = pool.run(signal).await;
        assert_eq!(stats.sessions, 0);
        assert!(stats.spawn_failures >= 2, "{stats:?}");
    }
}
