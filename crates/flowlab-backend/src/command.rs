use flowlab_abstract::EnvironmentError;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command to completion, whatever its exit status.
pub async fn run(program: &str, args: &[String]) -> Result<CommandOutput, EnvironmentError> {
    debug!(command = %render(program, args), "exec");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| EnvironmentError::Spawn {
            command: render(program, args),
            source,
        })?;

    Ok(CommandOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a command and turn a non-zero exit into an [`EnvironmentError`].
pub async fn run_checked(program: &str, args: &[String]) -> Result<CommandOutput, EnvironmentError> {
    let output = run(program, args).await?;
    if output.success {
        Ok(output)
    } else {
        Err(failure(render(program, args), output))
    }
}

pub fn failure(command: String, output: CommandOutput) -> EnvironmentError {
    let lowered = output.stderr.to_ascii_lowercase();
    if lowered.contains("operation not permitted")
        || lowered.contains("permission denied")
        || lowered.contains("must be root")
    {
        EnvironmentError::MissingPrivileges(command)
    } else {
        EnvironmentError::CommandFailed {
            command,
            status: output.status,
            stderr: output.stderr,
        }
    }
}

/// Locate `binary` on `PATH`.
pub fn which(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = Path::new(binary);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

pub fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            status: "exit status: 2".to_string(),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn permission_errors_are_reported_as_missing_privileges() {
        let err = failure(
            "tc qdisc add dev eth0 root netem delay 10ms".to_string(),
            output("RTNETLINK answers: Operation not permitted"),
        );
        assert!(matches!(err, EnvironmentError::MissingPrivileges(_)));

        let err = failure("tc qdisc show".to_string(), output("Cannot find device \"eth9\""));
        assert!(matches!(err, EnvironmentError::CommandFailed { .. }));
    }

    #[test]
    fn renders_command_lines() {
        assert_eq!(render("tc", &args(["qdisc", "show"])), "tc qdisc show");
    }

    #[test]
    fn unknown_binaries_are_not_found() {
        assert_eq!(which("flowlab-definitely-not-installed"), None);
        assert_eq!(which("/nonexistent/dir/tc"), None);
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_command_failed() {
        let err = run_checked("sh", &args(["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            EnvironmentError::CommandFailed { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run("flowlab-definitely-not-installed", &[]).await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Spawn { .. }));
    }
}
