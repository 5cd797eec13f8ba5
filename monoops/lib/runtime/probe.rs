use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reads process and host statistics from the OS.
///
/// CPU percentages are relative to the previous refresh, so a long-lived probe gives more accurate
/// numbers than a fresh one.
pub struct SystemProbe {
    system: Mutex<System>,
}

/// A point-in-time view of one OS process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// The process id.
    pub pid: u32,

    /// The parent process id.
    pub parent_pid: Option<u32>,

    /// The executable name.
    pub name: String,

    /// The full command line.
    pub command: Vec<String>,

    /// The working directory, if readable.
    pub cwd: Option<PathBuf>,

    /// CPU usage in percent of one core.
    pub cpu_percent: f32,

    /// Resident memory in bytes.
    pub memory_bytes: u64,

    /// Bytes read from disk since the previous refresh.
    pub disk_read_bytes: u64,

    /// Bytes written to disk since the previous refresh.
    pub disk_write_bytes: u64,

    /// Open file descriptors, if readable.
    pub open_files: Option<u64>,

    /// Open sockets, if readable.
    pub open_sockets: Option<u64>,
}

/// Host capacity and load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    /// Logical CPU count.
    pub cpu_cores: usize,

    /// Global CPU usage in percent.
    pub cpu_usage_percent: f32,

    /// One-minute load average.
    pub load_average: f64,

    /// Total memory in megabytes.
    pub total_memory_mb: u64,

    /// Available memory in megabytes.
    pub available_memory_mb: u64,

    /// Total disk space across mounted disks in megabytes.
    pub total_disk_mb: u64,

    /// Available disk space across mounted disks in megabytes.
    pub available_disk_mb: u64,

    /// Bytes received on all interfaces since boot.
    pub network_received_bytes: u64,

    /// Bytes transmitted on all interfaces since boot.
    pub network_transmitted_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SystemProbe {
    /// Creates a probe with no data loaded yet.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Samples a single process, or `None` if it no longer exists.
    pub fn process(&self, pid: u32) -> Option<ProcessSample> {
        let mut system = self.system.lock().ok()?;
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(pid).map(sample).map(with_descriptors)
    }

    /// Finds every process attributable to a project.
    ///
    /// A process belongs to the project when its command line mentions the project path or id,
    /// its working directory is inside the project, its name contains the id, or it descends from
    /// one of `known_pids`.
    pub fn project_processes(
        &self,
        project_id: &str,
        project_path: &Path,
        known_pids: &[u32],
    ) -> Vec<ProcessSample> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let path_str = project_path.to_string_lossy();
        let own_pid = std::process::id();
        let samples: Vec<ProcessSample> = system.processes().values().map(sample).collect();

        let mut matched: Vec<u32> = samples
            .iter()
            .filter(|s| s.pid != own_pid)
            .filter(|s| {
                known_pids.contains(&s.pid)
                    || s.name.contains(project_id)
                    || s.cwd.as_deref().is_some_and(|cwd| cwd.starts_with(project_path))
                    || s
                        .command
                        .iter()
                        .any(|arg| arg.contains(path_str.as_ref()) || arg.contains(project_id))
            })
            .map(|s| s.pid)
            .collect();

        // Pull in descendants of matched processes, e.g. workers forked by `npm start`.
        loop {
            let before = matched.len();
            for s in &samples {
                if let Some(parent) = s.parent_pid {
                    if matched.contains(&parent) && !matched.contains(&s.pid) && s.pid != own_pid {
                        matched.push(s.pid);
                    }
                }
            }
            if matched.len() == before {
                break;
            }
        }

        samples
            .into_iter()
            .filter(|s| matched.contains(&s.pid))
            .map(with_descriptors)
            .collect()
    }

    /// Reads host capacity and load.
    pub fn system_resources(&self) -> SystemResources {
        let (cpu_cores, cpu_usage_percent, total_memory, available_memory) =
            match self.system.lock() {
                Ok(mut system) => {
                    system.refresh_memory();
                    system.refresh_cpu_usage();
                    (
                        system.cpus().len().max(1),
                        system.global_cpu_usage(),
                        system.total_memory(),
                        system.available_memory(),
                    )
                }
                Err(_) => (1, 0.0, 0, 0),
            };

        let disks = Disks::new_with_refreshed_list();
        let (total_disk, available_disk) = disks.list().iter().fold((0u64, 0u64), |acc, d| {
            (acc.0 + d.total_space(), acc.1 + d.available_space())
        });

        let networks = Networks::new_with_refreshed_list();
        let (received, transmitted) = networks.iter().fold((0u64, 0u64), |acc, (_, data)| {
            (
                acc.0 + data.total_received(),
                acc.1 + data.total_transmitted(),
            )
        });

        SystemResources {
            cpu_cores,
            cpu_usage_percent,
            load_average: System::load_average().one,
            total_memory_mb: total_memory / (1024 * 1024),
            available_memory_mb: available_memory / (1024 * 1024),
            total_disk_mb: total_disk / (1024 * 1024),
            available_disk_mb: available_disk / (1024 * 1024),
            network_received_bytes: received,
            network_transmitted_bytes: transmitted,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn sample(process: &sysinfo::Process) -> ProcessSample {
    let pid = process.pid().as_u32();
    let disk = process.disk_usage();
    ProcessSample {
        pid,
        parent_pid: process.parent().map(|p| p.as_u32()),
        name: process.name().to_string_lossy().to_string(),
        command: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect(),
        cwd: process.cwd().map(Path::to_path_buf),
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
        disk_read_bytes: disk.read_bytes,
        disk_write_bytes: disk.written_bytes,
        open_files: None,
        open_sockets: None,
    }
}

fn with_descriptors(mut sample: ProcessSample) -> ProcessSample {
    (sample.open_files, sample.open_sockets) = count_descriptors(sample.pid).unzip();
    sample
}

/// Counts `/proc/<pid>/fd` entries, and how many of them are sockets.
fn count_descriptors(pid: u32) -> Option<(u64, u64)> {
    let entries = std::fs::read_dir(format!("/proc/{}/fd", pid)).ok()?;
    let (mut files, mut sockets) = (0, 0);
    for entry in entries.flatten() {
        files += 1;
        if std::fs::read_link(entry.path())
            .is_ok_and(|target| target.to_string_lossy().starts_with("socket:"))
        {
            sockets += 1;
        }
    }
    Some((files, sockets))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_sees_current_process() {
        let probe = SystemProbe::new();
        let me = probe.process(std::process::id()).expect("current process");
        assert_eq!(me.pid, std::process::id());
        assert!(me.memory_bytes > 0);
    }

    #[test]
    fn test_system_resources_reports_capacity() {
        let resources = SystemProbe::new().system_resources();
        assert!(resources.cpu_cores >= 1);
        assert!(resources.total_memory_mb > 0);
    }
}
