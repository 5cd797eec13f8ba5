use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::{resources::ResourceLimits, MonoopsError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Not running.
    Stopped,

    /// Spawned, waiting for the confirmation poll.
    Starting,

    /// Every process is alive.
    Running,

    /// A stop is in progress.
    Stopping,

    /// A process terminated abnormally without an explicit stop.
    Crashed,

    /// The OS could not be inspected.
    Unknown,
}

/// The state of one OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Alive.
    Running,

    /// Exited cleanly, or stopped on request.
    Stopped,

    /// Exited abnormally.
    Crashed,

    /// The OS could not be inspected.
    Unknown,
}

/// The runtime shape of a project, detected from its marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// `package.json`.
    Node,

    /// `requirements.txt`, `pyproject.toml`, `Pipfile` or `setup.py`.
    Python,

    /// `go.mod`.
    Go,

    /// `Cargo.toml`.
    Rust,

    /// `index.html` with no other manifest.
    Static,

    /// Started from an explicit command.
    Custom,

    /// Nothing recognizable.
    Unknown,
}

/// One OS process belonging to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// The process id.
    pub pid: u32,

    /// The executable name.
    pub name: String,

    /// The current state.
    pub status: ProcessStatus,

    /// CPU usage in percent of one core at the last poll.
    pub cpu_percent: f32,

    /// Resident memory in bytes at the last poll.
    pub memory_bytes: u64,

    /// Ports allocated to the process.
    pub ports: Vec<u16>,

    /// The argv the process was started with.
    pub command: Vec<String>,

    /// Where output is logged.
    pub log_path: PathBuf,

    /// When the process was spawned.
    pub started_at: DateTime<Utc>,

    /// The exit code, once the process has exited.
    pub exit_code: Option<i32>,
}

/// A project's current execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RunningProject {
    /// The project id.
    pub(crate) id: String,

    /// The project directory.
    pub(crate) path: PathBuf,

    /// The detected project type.
    pub(crate) project_type: ProjectType,

    /// The aggregated status.
    pub(crate) status: ProjectStatus,

    /// The processes started for the project.
    pub(crate) processes: Vec<ProcessInfo>,

    /// The first allocated port.
    pub(crate) primary_port: Option<u16>,

    /// The URL polled by the health monitor.
    pub(crate) health_url: Option<String>,

    /// The environment the project was started with.
    pub(crate) environment: String,

    /// Limits applied by the resource allocator.
    pub(crate) resource_limits: Option<ResourceLimits>,

    /// When the project was started.
    pub(crate) started_at: Option<DateTime<Utc>>,

    /// Result of the most recent health check.
    pub(crate) last_health_ok: Option<bool>,

    /// When the most recent health check ran.
    pub(crate) last_health_check: Option<DateTime<Utc>>,
}

/// Per-project startup configuration from `.monoops/startup.yaml`.
///
/// The same shape is used for a caller-supplied override, whose set fields win over the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Overrides type detection.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,

    /// A shell command to run instead of the detected one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Working directory relative to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Ports to request. The first one becomes `PORT`.
    pub ports: Vec<u16>,

    /// How many ports to allocate when none are requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_count: Option<usize>,

    /// Path of the health endpoint on the primary port, e.g. `/health`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    /// An absolute health URL, used as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    /// A flat variable file, relative to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,

    /// Explicit variables; these win over every other source.
    pub env: HashMap<String, String>,
}

/// The result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOutcome {
    /// Whether the project is now stopped.
    pub success: bool,

    /// The status after the call.
    pub status: ProjectStatus,

    /// Ports released by the call.
    pub released_ports: Vec<u16>,

    /// Human-readable summary.
    pub message: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProjectStatus {
    /// Whether a start must be refused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl RunningProject {
    /// Creates a record for a project that is not running.
    pub fn stopped(id: impl Into<String>, path: impl Into<PathBuf>, project_type: ProjectType) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            project_type,
            status: ProjectStatus::Stopped,
            processes: Vec::new(),
            primary_port: None,
            health_url: None,
            environment: String::new(),
            resource_limits: None,
            started_at: None,
            last_health_ok: None,
            last_health_check: None,
        }
    }

    /// Pids of all tracked processes.
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.pid).collect()
    }

    /// All ports held by the project's processes.
    pub fn ports(&self) -> Vec<u16> {
        self.processes
            .iter()
            .flat_map(|p| p.ports.iter().copied())
            .collect()
    }

    /// Recomputes the project status from its processes.
    ///
    /// Running only when every process runs. Transitional states are kept while processes are
    /// still alive.
    pub(crate) fn aggregate_status(&mut self) {
        let aggregate = if self.processes.is_empty() {
            ProjectStatus::Stopped
        } else if self
            .processes
            .iter()
            .all(|p| p.status == ProcessStatus::Running)
        {
            ProjectStatus::Running
        } else if self
            .processes
            .iter()
            .any(|p| p.status == ProcessStatus::Crashed)
        {
            ProjectStatus::Crashed
        } else if self
            .processes
            .iter()
            .any(|p| p.status == ProcessStatus::Unknown)
        {
            ProjectStatus::Unknown
        } else {
            ProjectStatus::Stopped
        };

        let keep_transitional = matches!(
            self.status,
            ProjectStatus::Starting | ProjectStatus::Stopping
        ) && aggregate == ProjectStatus::Running;

        if !keep_transitional {
            self.status = aggregate;
        }
    }
}

impl StartupConfig {
    /// Overlays `other` on `self`: set scalar fields and non-empty collections in `other` win,
    /// variables are merged.
    pub fn merged_with(mut self, other: StartupConfig) -> Self {
        if other.project_type.is_some() {
            self.project_type = other.project_type;
        }
        if other.command.is_some() {
            self.command = other.command;
        }
        if other.working_dir.is_some() {
            self.working_dir = other.working_dir;
        }
        if !other.ports.is_empty() {
            self.ports = other.ports;
        }
        if other.port_count.is_some() {
            self.port_count = other.port_count;
        }
        if other.health_path.is_some() {
            self.health_path = other.health_path;
        }
        if other.health_url.is_some() {
            self.health_url = other.health_url;
        }
        if other.env_file.is_some() {
            self.env_file = other.env_file;
        }
        self.env.extend(other.env);
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Static => "static",
            Self::Custom => "custom",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProjectType {
    type Err = MonoopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "javascript" | "typescript" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "go" | "golang" => Ok(Self::Go),
            "rust" => Ok(Self::Rust),
            "static" | "html" => Ok(Self::Static),
            "custom" => Ok(Self::Custom),
            other => Err(MonoopsError::Validation(format!(
                "unknown project type: {}",
                other
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn process(status: ProcessStatus) -> ProcessInfo {
        ProcessInfo {
            pid: 1,
            name: "node".into(),
            status,
            cpu_percent: 0.0,
            memory_bytes: 0,
            ports: vec![],
            command: vec![],
            log_path: PathBuf::new(),
            started_at: Utc::now(),
            exit_code: None,
        }
    }

    #[test]
    fn test_running_only_when_all_processes_run() {
        let mut project = RunningProject::stopped("a", "/tmp/a", ProjectType::Node);
        project.processes = vec![process(ProcessStatus::Running), process(ProcessStatus::Running)];
        project.aggregate_status();
        assert_eq!(project.status, ProjectStatus::Running);

        project.processes[1].status = ProcessStatus::Crashed;
        project.aggregate_status();
        assert_eq!(project.status, ProjectStatus::Crashed);

        project.processes[1].status = ProcessStatus::Stopped;
        project.aggregate_status();
        assert_eq!(project.status, ProjectStatus::Stopped);
    }

    #[test]
    fn test_starting_is_kept_while_processes_live() {
        let mut project = RunningProject::stopped("a", "/tmp/a", ProjectType::Node);
        project.status = ProjectStatus::Starting;
        project.processes = vec![process(ProcessStatus::Running)];
        project.aggregate_status();
        assert_eq!(project.status, ProjectStatus::Starting);
    }

    #[test]
    fn test_override_wins_over_file_config() {
        let file = StartupConfig {
            command: Some("npm start".into()),
            ports: vec![3000],
            env: HashMap::from([("A".into(), "1".into()), ("B".into(), "1".into())]),
            ..Default::default()
        };
        let custom = StartupConfig {
            ports: vec![4000],
            env: HashMap::from([("B".into(), "2".into())]),
            ..Default::default()
        };

        let merged = file.merged_with(custom);
        assert_eq!(merged.command.as_deref(), Some("npm start"));
        assert_eq!(merged.ports, vec![4000]);
        assert_eq!(merged.env["A"], "1");
        assert_eq!(merged.env["B"], "2");
    }
}
