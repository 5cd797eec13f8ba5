use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    time,
};

use crate::{utils, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often termination polls for process exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// The exit code, if the process exited normally.
    pub code: Option<i32>,

    /// The terminating signal, if any.
    pub signal: Option<i32>,

    /// When the exit was observed.
    pub at: DateTime<Utc>,
}

/// Exit records of supervised children, keyed by pid.
///
/// Filled by the waiter task spawned with each child, so a dead child can be told apart as crashed
/// or cleanly exited.
#[derive(Debug, Clone, Default)]
pub struct ExitRegistry {
    records: Arc<Mutex<HashMap<u32, ExitRecord>>>,
}

/// What to spawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// The program followed by its arguments.
    pub argv: Vec<String>,

    /// The working directory.
    pub cwd: PathBuf,

    /// Extra environment variables.
    pub envs: HashMap<String, String>,

    /// Where stdout and stderr are appended.
    pub log_path: PathBuf,
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was already gone.
    NotRunning,

    /// The process exited within the grace period.
    Exited,

    /// The process had to be force-killed.
    Killed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExitRecord {
    /// Whether the process exited with status zero.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl ExitRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the exit record of `pid`, if it has exited.
    pub fn get(&self, pid: u32) -> Option<ExitRecord> {
        self.records.lock().ok()?.get(&pid).cloned()
    }

    /// Forgets `pid`.
    pub fn forget(&self, pid: u32) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(&pid);
        }
    }

    fn record(&self, pid: u32, record: ExitRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(pid, record);
        }
    }

    /// Whether `pid` is gone, either reaped by its waiter or unknown to the OS.
    pub fn has_exited(&self, pid: u32) -> bool {
        self.get(pid).is_some() || !utils::is_process_running(pid)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns a supervised child in its own process group and returns its pid.
///
/// Output lines are appended to the log file, and a waiter task records the exit status in
/// `exits` once the child terminates.
pub async fn spawn_supervised(spec: &SpawnSpec, exits: &ExitRegistry) -> MonoopsResult<u32> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(crate::MonoopsError::Validation("empty command".to_string()));
    };

    if let Some(parent) = spec.log_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .await?;
    log.write_all(format!("--- {} {} ---\n", Utc::now().to_rfc3339(), spec.argv.join(" ")).as_bytes())
        .await?;
    drop(log);

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&spec.cwd)
        .envs(&spec.envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let pid = child.id().ok_or_else(|| {
        crate::MonoopsError::custom(anyhow::anyhow!("child exited before its pid was read"))
    })?;

    let stdout_handle = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump_to_log(out, spec.log_path.clone())));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump_to_log(err, spec.log_path.clone())));

    let exits = exits.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                tracing::info!(pid, status = %status, "supervised process exited");
                exits.record(
                    pid,
                    ExitRecord {
                        code: status.code(),
                        signal: status.signal(),
                        at: Utc::now(),
                    },
                );
            }
            Err(e) => tracing::error!(pid, error = %e, "error waiting for supervised process"),
        }

        // Let the pumps drain whatever is left in the pipes.
        for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
            let _ = handle.await;
        }
    });

    tracing::debug!(pid, argv = ?spec.argv, log = %spec.log_path.display(), "spawned supervised process");
    Ok(pid)
}

/// Stops `pid` and its process group.
///
/// A graceful stop sends `SIGTERM` and waits up to `grace` before escalating to `SIGKILL`; a forced
/// stop sends `SIGKILL` straight away.
pub async fn terminate(
    pid: u32,
    graceful: bool,
    grace: Duration,
    exits: &ExitRegistry,
) -> TerminateOutcome {
    if exits.has_exited(pid) {
        return TerminateOutcome::NotRunning;
    }

    if graceful {
        signal_group(pid, Signal::SIGTERM);
        if wait_for_exit(pid, grace, exits).await {
            return TerminateOutcome::Exited;
        }
        tracing::warn!(pid, grace_secs = grace.as_secs(), "process ignored SIGTERM, killing");
    }

    signal_group(pid, Signal::SIGKILL);
    wait_for_exit(pid, Duration::from_secs(2), exits).await;
    TerminateOutcome::Killed
}

/// Polls until `pid` exits or `timeout` elapses, returning whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration, exits: &ExitRegistry) -> bool {
    let deadline = time::Instant::now() + timeout;
    loop {
        if exits.has_exited(pid) {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Signals the process group led by `pid`, falling back to the process itself.
fn signal_group(pid: u32, sig: Signal) {
    if signal::killpg(Pid::from_raw(pid as i32), sig).is_err() {
        utils::send_signal(pid, sig);
    }
}

async fn pump_to_log<R>(reader: R, log_path: PathBuf)
where
    R: AsyncRead + Unpin,
{
    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(log = %log_path.display(), error = %e, "failed to open process log");
            return;
        }
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::error!(log = %log_path.display(), error = %e, "failed to write process log");
            break;
        }
    }
    let _ = file.flush().await;
}

/// Returns the path of a project's per-environment log file.
pub fn project_log_path(log_dir: &Path, project_id: &str, environment: &str) -> PathBuf {
    log_dir.join(project_id).join(format!("{}.log", environment))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path, script: &str) -> SpawnSpec {
        SpawnSpec {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            cwd: dir.to_path_buf(),
            envs: HashMap::new(),
            log_path: dir.join("logs").join("out.log"),
        }
    }

    #[tokio::test]
    async fn test_spawn_records_exit_and_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exits = ExitRegistry::new();

        let pid = spawn_supervised(&spec(dir.path(), "echo hello; exit 3"), &exits).await?;
        assert!(wait_for_exit(pid, Duration::from_secs(5), &exits).await);

        // Give the waiter a moment to store the record after reaping.
        time::sleep(Duration::from_millis(200)).await;
        let record = exits.get(pid).expect("exit record");
        assert_eq!(record.code, Some(3));
        assert!(!record.is_clean());

        let log = fs::read_to_string(dir.path().join("logs/out.log")).await?;
        assert!(log.contains("hello"));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exits = ExitRegistry::new();

        let pid = spawn_supervised(&spec(dir.path(), "trap '' TERM; sleep 30"), &exits).await?;
        time::sleep(Duration::from_millis(200)).await;

        let outcome = terminate(pid, true, Duration::from_millis(300), &exits).await;
        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(exits.has_exited(pid));

        assert_eq!(
            terminate(pid, true, Duration::from_millis(300), &exits).await,
            TerminateOutcome::NotRunning
        );
        Ok(())
    }
}
