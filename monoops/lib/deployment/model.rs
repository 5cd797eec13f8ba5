use std::{fmt, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Status code an HTTP check expects when none is configured.
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Directory and file names never copied into a deployment workspace.
pub const DEPLOY_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".pytest_cache",
    ".mypy_cache",
    "target",
    ".next",
    ".cache",
    ".monoops",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a deployment is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Accepted, not started.
    Pending,

    /// Copying sources and writing the env file.
    Preparing,

    /// Running the build command.
    Building,

    /// Running the test command.
    Testing,

    /// Running the deploy command.
    Deploying,

    /// Finished and healthy.
    Success,

    /// A stage or the health check failed.
    Failed,

    /// A rollback is being applied.
    RollingBack,

    /// Superseded by a rollback deployment.
    RolledBack,
}

/// Aggregate outcome of a set of health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,

    /// Some checks passed and the rest could not be evaluated.
    Degraded,

    /// At least one check failed.
    Unhealthy,

    /// No checks configured, or none could be evaluated.
    #[default]
    Unknown,
}

/// The outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The check passed.
    Pass,

    /// The check ran and failed.
    Fail,

    /// The check could not be evaluated.
    Unknown,
}

/// A single probe of a deployed project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// An HTTP GET that must answer with `expected_status`.
    Http {
        /// The URL to request.
        url: String,

        /// The status code that counts as healthy.
        #[serde(default = "default_expected_status")]
        expected_status: u16,

        /// Per-check timeout override.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// A TCP connect that must succeed.
    Tcp {
        /// The host to connect to.
        #[serde(default = "default_host")]
        host: String,

        /// The port to connect to.
        port: u16,

        /// Per-check timeout override.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// A shell command that must exit zero.
    Command {
        /// The command, run with `sh -c`.
        command: String,

        /// Per-check timeout override.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

/// The result of running one [`HealthCheck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// The check that ran.
    pub check: HealthCheck,

    /// Its outcome.
    pub outcome: CheckOutcome,

    /// What was observed.
    pub message: String,

    /// How long the check took.
    pub duration_ms: u64,
}

/// The results of a batch of health checks and their aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// The aggregate status.
    pub status: HealthStatus,

    /// Per-check results in configuration order.
    pub results: Vec<HealthCheckResult>,
}

/// A project's deployment pipeline, read from `.monoops/deploy.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Build stage command. Skipped when absent.
    pub build_command: Option<String>,

    /// Test stage command. Skipped when absent.
    pub test_command: Option<String>,

    /// Deploy stage command. Skipped when absent.
    pub deploy_command: Option<String>,

    /// Checks run after the deploy stage.
    pub health_checks: Vec<HealthCheck>,

    /// Roll back to the last good deployment when the pipeline or health check fails.
    pub auto_rollback_on_failure: bool,

    /// Per-stage timeout; falls back to the global command timeout.
    pub stage_timeout_secs: Option<u64>,

    /// Glob patterns, relative to the workspace, listed as artifacts after the build stage.
    pub artifacts: Vec<String>,

    /// Extra names excluded from the workspace copy.
    pub exclude: Vec<String>,
}

/// One execution of the deployment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Unique id.
    pub id: String,

    /// The project deployed.
    pub project_id: String,

    /// Current pipeline state.
    pub status: DeploymentStatus,

    /// Free-form target name, e.g. `local` or `staging`.
    pub target: String,

    /// The environment whose variables were materialized.
    pub environment: String,

    /// The source commit, when the project is a git checkout.
    pub commit_hash: Option<String>,

    /// The isolated workspace the pipeline ran in.
    pub workspace: PathBuf,

    /// Stage-by-stage log lines.
    pub logs: Vec<String>,

    /// Aggregate health after the deploy stage.
    pub health_status: HealthStatus,

    /// Individual health check results.
    pub health_results: Vec<HealthCheckResult>,

    /// Files matched by the artifact patterns.
    pub artifacts: Vec<String>,

    /// The failure that stopped the pipeline.
    pub error: Option<String>,

    /// Set on a rolled-back deployment: the deployment that replaced it.
    pub rollback_deployment_id: Option<String>,

    /// Set on a rollback deployment: the deployment it rolled back.
    pub rollback_of: Option<String>,

    /// Set on a rollback deployment: the successful deployment it re-applied.
    pub source_deployment_id: Option<String>,

    /// When the pipeline started.
    pub started_at: DateTime<Utc>,

    /// When the pipeline reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// One of the two blue-green instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instance {
    /// The blue instance.
    Blue,

    /// The green instance.
    Green,
}

/// Which instance of a (project, environment) pair is receiving traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueGreenRecord {
    /// The project.
    pub project_id: String,

    /// The environment.
    pub environment: String,

    /// The instance traffic goes to, if any deployment has passed yet.
    pub active: Option<Instance>,

    /// Latest deployment to the blue instance.
    pub blue_deployment_id: Option<String>,

    /// Latest deployment to the green instance.
    pub green_deployment_id: Option<String>,

    /// When traffic last moved.
    pub switched_at: Option<DateTime<Utc>>,
}

/// The result of a blue-green cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueGreenOutcome {
    /// The deployment made to the inactive instance.
    pub deployment: DeploymentResult,

    /// The instance deployed to.
    pub instance: Instance,

    /// Whether traffic moved to `instance`.
    pub switched: bool,

    /// The record after the cycle.
    pub record: BlueGreenRecord,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeploymentStatus {
    /// Whether the pipeline has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }
}

impl HealthStatus {
    /// Aggregates check outcomes.
    pub fn aggregate<'a>(outcomes: impl IntoIterator<Item = &'a CheckOutcome>) -> Self {
        let (mut pass, mut fail, mut unknown) = (0, 0, 0);
        for outcome in outcomes {
            match outcome {
                CheckOutcome::Pass => pass += 1,
                CheckOutcome::Fail => fail += 1,
                CheckOutcome::Unknown => unknown += 1,
            }
        }

        match (pass, fail, unknown) {
            (_, f, _) if f > 0 => HealthStatus::Unhealthy,
            (0, _, _) => HealthStatus::Unknown,
            (_, _, 0) => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }
}

impl HealthCheck {
    /// The timeout for this check, or `default` when not overridden.
    pub fn timeout(&self, default: Duration) -> Duration {
        let secs = match self {
            HealthCheck::Http { timeout_secs, .. }
            | HealthCheck::Tcp { timeout_secs, .. }
            | HealthCheck::Command { timeout_secs, .. } => *timeout_secs,
        };
        secs.map(Duration::from_secs).unwrap_or(default)
    }
}

impl HealthReport {
    /// Builds a report from individual results.
    pub fn from_results(results: Vec<HealthCheckResult>) -> Self {
        Self {
            status: HealthStatus::aggregate(results.iter().map(|r| &r.outcome)),
            results,
        }
    }
}

impl DeploymentResult {
    /// Creates a pending deployment.
    pub fn new(
        project_id: &str,
        target: &str,
        environment: &str,
        workspace: PathBuf,
        id: String,
    ) -> Self {
        Self {
            id,
            project_id: project_id.to_string(),
            status: DeploymentStatus::Pending,
            target: target.to_string(),
            environment: environment.to_string(),
            commit_hash: None,
            workspace,
            logs: Vec::new(),
            health_status: HealthStatus::Unknown,
            health_results: Vec::new(),
            artifacts: Vec::new(),
            error: None,
            rollback_deployment_id: None,
            rollback_of: None,
            source_deployment_id: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Appends a timestamped log line.
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.logs
            .push(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line.as_ref()));
    }

    /// Moves to a terminal failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.log(format!("failed: {}", error));
        self.status = DeploymentStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

impl Instance {
    /// The other instance.
    pub fn other(&self) -> Self {
        match self {
            Instance::Blue => Instance::Green,
            Instance::Green => Instance::Blue,
        }
    }
}

impl BlueGreenRecord {
    /// A record with nothing deployed yet.
    pub fn new(project_id: &str, environment: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            environment: environment.to_string(),
            active: None,
            blue_deployment_id: None,
            green_deployment_id: None,
            switched_at: None,
        }
    }

    /// The instance the next cycle deploys to.
    pub fn inactive(&self) -> Instance {
        self.active.map(|i| i.other()).unwrap_or(Instance::Blue)
    }

    /// Records a deployment to `instance`.
    pub fn set_deployment(&mut self, instance: Instance, deployment_id: &str) {
        let slot = match instance {
            Instance::Blue => &mut self.blue_deployment_id,
            Instance::Green => &mut self.green_deployment_id,
        };
        *slot = Some(deployment_id.to_string());
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_expected_status() -> u16 {
    DEFAULT_EXPECTED_STATUS
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            test_command: None,
            deploy_command: None,
            health_checks: Vec::new(),
            auto_rollback_on_failure: true,
            stage_timeout_secs: None,
            artifacts: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Preparing => "preparing",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Testing => "testing",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instance::Blue => write!(f, "blue"),
            Instance::Green => write!(f, "green"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
