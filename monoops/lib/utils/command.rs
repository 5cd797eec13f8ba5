use std::{collections::HashMap, path::Path, process::Stdio, time::Duration};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{process::Command, time};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The captured result of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, or `None` if the command was terminated by a signal.
    pub exit_code: Option<i32>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr joined, for attaching to a result's log.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `command` through `sh -c` in `cwd`, killing it if it outlives `timeout`.
///
/// The shell leads its own process group, so a timeout also kills anything it started.
///
/// A non-zero exit is returned as a normal `CommandOutput`; only spawn failures and timeouts are
/// errors.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    envs: &HashMap<String, String>,
    timeout: Duration,
) -> MonoopsResult<CommandOutput> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id();

    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            Err(MonoopsError::Timeout {
                operation: command.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

fn kill_group(pid: u32) {
    if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "process group already gone");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_captures_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut envs = HashMap::new();
        envs.insert("GREETING".to_string(), "hi".to_string());

        let output = run_shell("echo $GREETING; exit 3", dir.path(), &envs, Duration::from_secs(5))
            .await?;

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "hi");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_shell_times_out() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = run_shell(
            "sleep 5",
            dir.path(),
            &HashMap::new(),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(MonoopsError::Timeout { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_shell_timeout_kills_background_children() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ticks = dir.path().join("ticks");
        let result = run_shell(
            "(while :; do echo x >> ticks; sleep 0.05; done) & sleep 30",
            dir.path(),
            &HashMap::new(),
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(MonoopsError::Timeout { .. })));

        time::sleep(Duration::from_millis(200)).await;
        let after_kill = std::fs::metadata(&ticks)?.len();
        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(std::fs::metadata(&ticks)?.len(), after_kill);
        Ok(())
    }
}
