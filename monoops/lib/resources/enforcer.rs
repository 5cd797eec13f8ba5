use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use tokio::{fs, process::Command};

use crate::{MonoopsError, MonoopsResult};

use super::{EnforcementMethod, Priority, ResourceLimits};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The cgroup v2 mount point.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// The parent group monoops creates project groups under.
const CGROUP_PARENT: &str = "monoops";

/// The CFS period written to `cpu.max`, in microseconds.
const CPU_PERIOD_MICROS: u64 = 100_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A mechanism that makes resource limits binding.
#[async_trait]
pub trait LimitEnforcer: Send + Sync {
    /// The method this enforcer implements.
    fn method(&self) -> EnforcementMethod;

    /// Whether the backend can be used on this host.
    async fn is_available(&self) -> bool;

    /// Applies `limits` to the project and its processes.
    async fn apply(
        &self,
        project_id: &str,
        pids: &[u32],
        limits: &ResourceLimits,
        priority: Priority,
    ) -> MonoopsResult<()>;
}

/// Updates a running container named after the project.
#[derive(Debug, Default)]
pub struct DockerEnforcer;

/// Places the project's processes in a cgroup v2 group with `cpu.max`, `memory.max` and
/// `pids.max` set.
#[derive(Debug)]
pub struct CgroupEnforcer {
    root: PathBuf,
}

/// Adjusts niceness, CPU affinity and rlimits of each process.
#[derive(Debug, Default)]
pub struct ProcessEnforcer;

/// Applies nothing. Allocations made through it report `enforced = false`.
#[derive(Debug, Default)]
pub struct NoopEnforcer;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CgroupEnforcer {
    /// Creates an enforcer rooted at the standard cgroup mount.
    pub fn new() -> Self {
        Self::with_root(CGROUP_ROOT)
    }

    /// Creates an enforcer rooted at `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn group_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(CGROUP_PARENT).join(project_id)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The enforcers tried in order: container, cgroup, process, then the no-op fallback.
pub fn default_enforcers() -> Vec<Arc<dyn LimitEnforcer>> {
    vec![
        Arc::new(DockerEnforcer),
        Arc::new(CgroupEnforcer::new()),
        Arc::new(ProcessEnforcer),
        Arc::new(NoopEnforcer),
    ]
}

fn unavailable(method: EnforcementMethod, reason: impl std::fmt::Display) -> MonoopsError {
    MonoopsError::EnforcementUnavailable(format!("{}: {}", method, reason))
}

/// Sets a soft and hard rlimit on another process.
fn set_rlimit(pid: u32, resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` outlives the call and the old-limit pointer is null.
    let rc = unsafe {
        libc::prlimit(
            pid as libc::pid_t,
            resource,
            &limit as *const libc::rlimit,
            std::ptr::null_mut(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn set_niceness(pid: u32, niceness: i32) -> std::io::Result<()> {
    // SAFETY: plain syscall without pointers.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LimitEnforcer for DockerEnforcer {
    fn method(&self) -> EnforcementMethod {
        EnforcementMethod::Docker
    }

    async fn is_available(&self) -> bool {
        which::which("docker").is_ok()
    }

    async fn apply(
        &self,
        project_id: &str,
        _pids: &[u32],
        limits: &ResourceLimits,
        _priority: Priority,
    ) -> MonoopsResult<()> {
        let inspect = Command::new("docker")
            .args(["inspect", "--type", "container", project_id])
            .output()
            .await?;
        if !inspect.status.success() {
            return Err(unavailable(self.method(), format!("no container named {}", project_id)));
        }

        let cores = num_cores();
        let cpus = format!("{:.2}", limits.cpu_percent / 100.0 * cores as f64);
        let memory = format!("{}m", limits.memory_mb);
        let mut args = vec![
            "update".to_string(),
            "--cpus".to_string(),
            cpus,
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
        ];
        if let Some(max) = limits.max_processes {
            args.extend(["--pids-limit".to_string(), max.to_string()]);
        }
        args.push(project_id.to_string());

        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            return Err(MonoopsError::ExecutionFailed(format!(
                "docker update failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LimitEnforcer for CgroupEnforcer {
    fn method(&self) -> EnforcementMethod {
        EnforcementMethod::Cgroup
    }

    async fn is_available(&self) -> bool {
        let controllers = self.root.join("cgroup.controllers");
        match fs::metadata(&self.root).await {
            Ok(meta) => controllers.exists() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    async fn apply(
        &self,
        project_id: &str,
        pids: &[u32],
        limits: &ResourceLimits,
        _priority: Priority,
    ) -> MonoopsResult<()> {
        if pids.is_empty() {
            return Err(unavailable(self.method(), "no processes to place"));
        }

        let parent = self.root.join(CGROUP_PARENT);
        let group = self.group_dir(project_id);
        fs::create_dir_all(&group).await?;

        for dir in [&self.root, &parent] {
            if let Err(e) = fs::write(dir.join("cgroup.subtree_control"), "+cpu +memory +pids").await {
                tracing::debug!(dir = %dir.display(), error = %e, "could not enable cgroup controllers");
            }
        }

        let quota = (limits.cpu_percent / 100.0 * num_cores() as f64 * CPU_PERIOD_MICROS as f64)
            .round()
            .max(1000.0) as u64;
        fs::write(group.join("cpu.max"), format!("{} {}", quota, CPU_PERIOD_MICROS)).await?;
        fs::write(
            group.join("memory.max"),
            (limits.memory_mb * 1024 * 1024).to_string(),
        )
        .await?;
        if let Some(max) = limits.max_processes {
            fs::write(group.join("pids.max"), max.to_string()).await?;
        }

        for pid in pids {
            fs::write(group.join("cgroup.procs"), pid.to_string()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LimitEnforcer for ProcessEnforcer {
    fn method(&self) -> EnforcementMethod {
        EnforcementMethod::Process
    }

    async fn is_available(&self) -> bool {
        cfg!(target_os = "linux")
    }

    async fn apply(
        &self,
        project_id: &str,
        pids: &[u32],
        limits: &ResourceLimits,
        priority: Priority,
    ) -> MonoopsResult<()> {
        if pids.is_empty() {
            return Err(unavailable(self.method(), "no processes to adjust"));
        }

        let cpu_set = match limits.cpu_cores {
            Some(cores) => {
                let mut set = CpuSet::new();
                for core in 0..cores.min(num_cores()) {
                    set.set(core).map_err(|e| MonoopsError::custom(anyhow::anyhow!(e)))?;
                }
                Some(set)
            }
            None => None,
        };

        let mut adjusted = 0;
        for &pid in pids {
            let mut ok = true;

            if let Err(e) = set_niceness(pid, priority.niceness()) {
                tracing::debug!(project_id, pid, error = %e, "failed to set niceness");
                ok = false;
            }
            if let Some(set) = &cpu_set {
                if let Err(e) = sched_setaffinity(Pid::from_raw(pid as i32), set) {
                    tracing::debug!(project_id, pid, error = %e, "failed to set cpu affinity");
                    ok = false;
                }
            }
            if let Err(e) = set_rlimit(pid, libc::RLIMIT_AS, limits.memory_mb * 1024 * 1024) {
                tracing::debug!(project_id, pid, error = %e, "failed to set memory rlimit");
                ok = false;
            }
            if let Some(max) = limits.max_open_files {
                if let Err(e) = set_rlimit(pid, libc::RLIMIT_NOFILE, max) {
                    tracing::debug!(project_id, pid, error = %e, "failed to set file rlimit");
                    ok = false;
                }
            }
            if let Some(max) = limits.max_processes {
                if let Err(e) = set_rlimit(pid, libc::RLIMIT_NPROC, max) {
                    tracing::debug!(project_id, pid, error = %e, "failed to set process rlimit");
                    ok = false;
                }
            }

            if ok {
                adjusted += 1;
            }
        }

        if adjusted == 0 {
            return Err(unavailable(self.method(), "no process could be adjusted"));
        }
        Ok(())
    }
}

#[async_trait]
impl LimitEnforcer for NoopEnforcer {
    fn method(&self) -> EnforcementMethod {
        EnforcementMethod::None
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        _project_id: &str,
        _pids: &[u32],
        _limits: &ResourceLimits,
        _priority: Priority,
    ) -> MonoopsResult<()> {
        Ok(())
    }
}

fn num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_percent: 50.0,
            cpu_cores: None,
            memory_mb: 256,
            disk_read_mbps: None,
            disk_write_mbps: None,
            max_processes: Some(32),
            max_open_files: None,
        }
    }

    #[tokio::test]
    async fn test_cgroup_enforcer_writes_limits() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::write(root.path().join("cgroup.controllers"), "cpu memory pids").await?;
        let enforcer = CgroupEnforcer::with_root(root.path());
        assert!(enforcer.is_available().await);

        enforcer
            .apply("web", &[4242], &limits(), Priority::Normal)
            .await?;

        let group = root.path().join("monoops/web");
        assert_eq!(
            fs::read_to_string(group.join("memory.max")).await?,
            (256u64 * 1024 * 1024).to_string()
        );
        assert_eq!(fs::read_to_string(group.join("pids.max")).await?, "32");
        assert!(fs::read_to_string(group.join("cpu.max"))
            .await?
            .ends_with(" 100000"));
        assert_eq!(fs::read_to_string(group.join("cgroup.procs")).await?, "4242");
        Ok(())
    }

    #[tokio::test]
    async fn test_enforcers_refuse_empty_process_lists() {
        let root = tempfile::tempdir().expect("tempdir");
        let cgroup = CgroupEnforcer::with_root(root.path());
        let err = cgroup
            .apply("web", &[], &limits(), Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::EnforcementUnavailable);

        let err = ProcessEnforcer
            .apply("web", &[], &limits(), Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::EnforcementUnavailable);
    }

    #[tokio::test]
    async fn test_noop_always_succeeds() -> anyhow::Result<()> {
        assert!(NoopEnforcer.is_available().await);
        NoopEnforcer
            .apply("web", &[], &limits(), Priority::Low)
            .await?;
        assert_eq!(NoopEnforcer.method(), EnforcementMethod::None);
        Ok(())
    }
}
