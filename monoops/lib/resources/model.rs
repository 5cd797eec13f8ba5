use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default auto-scale trigger, in percent of the current limit.
pub const DEFAULT_SCALE_UP_THRESHOLD: f64 = 80.0;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How much of the requested maximum a project is granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Full share.
    Critical,

    /// 80%.
    High,

    /// 60%.
    #[default]
    Normal,

    /// 40%.
    Low,

    /// 20%.
    Background,
}

/// A caller's resource request.
///
/// CPU is in percent of total host capacity, memory in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    /// Lowest acceptable CPU share.
    pub min_cpu_percent: f64,

    /// Highest useful CPU share.
    pub max_cpu_percent: f64,

    /// Lowest acceptable memory.
    pub min_memory_mb: u64,

    /// Highest useful memory.
    pub max_memory_mb: u64,

    /// Cores to pin the project to.
    pub cpu_cores: Option<usize>,

    /// Disk read rate cap.
    pub disk_read_mbps: Option<f64>,

    /// Disk write rate cap.
    pub disk_write_mbps: Option<f64>,

    /// Process count cap.
    pub max_processes: Option<u64>,

    /// Open file descriptor cap.
    pub max_open_files: Option<u64>,

    /// Share multiplier.
    pub priority: Priority,

    /// Whether the auto-scale loop may adjust the limits.
    pub auto_scale: bool,

    /// Usage, in percent of the current limit, above which the auto-scaler grows the limit.
    pub scale_up_threshold: f64,
}

/// Concrete limits applied to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU share in percent of total host capacity.
    pub cpu_percent: f64,

    /// Cores the project is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<usize>,

    /// Memory cap in megabytes.
    pub memory_mb: u64,

    /// Disk read rate cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_read_mbps: Option<f64>,

    /// Disk write rate cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_write_mbps: Option<f64>,

    /// Process count cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,

    /// Open file descriptor cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<u64>,
}

/// The backend that made a limit binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMethod {
    /// `docker update` on a container named after the project.
    Docker,

    /// A cgroup v2 group per project.
    Cgroup,

    /// Niceness, CPU affinity and rlimits on each process.
    Process,

    /// Nothing applied.
    None,
}

/// A resource grant for a project. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// The project.
    pub project_id: String,

    /// The granted limits.
    pub limits: ResourceLimits,

    /// The request the limits were derived from.
    pub requirements: ResourceRequirements,

    /// How the limits were applied.
    pub method: EnforcementMethod,

    /// Whether any backend actually applied the limits.
    pub enforced: bool,

    /// Why enforcement did not happen, if it did not.
    pub message: Option<String>,

    /// When the allocation was made.
    pub allocated_at: DateTime<Utc>,
}

/// One usage sample for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// The project.
    pub project_id: String,

    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,

    /// CPU in percent of total host capacity.
    pub cpu_percent: f64,

    /// Resident memory in megabytes.
    pub memory_mb: f64,

    /// Memory in percent of host memory.
    pub memory_percent: f64,

    /// Bytes read from disk since the previous sample.
    pub disk_read_bytes: u64,

    /// Bytes written to disk since the previous sample.
    pub disk_write_bytes: u64,

    /// Open sockets across the project's processes.
    pub network_connections: u64,

    /// Number of processes attributed to the project.
    pub process_count: usize,

    /// Open file descriptors across the project's processes.
    pub open_files: u64,
}

/// A usage forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePrediction {
    /// The project.
    pub project_id: String,

    /// How far ahead the forecast looks, in hours.
    pub horizon_hours: f64,

    /// Forecast CPU percent.
    pub predicted_cpu_percent: f64,

    /// Forecast memory in megabytes.
    pub predicted_memory_mb: f64,

    /// CPU trend in percent per hour.
    pub cpu_trend_per_hour: f64,

    /// Memory trend in megabytes per hour.
    pub memory_trend_per_hour: f64,

    /// Confidence in `[0.3, 0.95]`.
    pub confidence: f64,

    /// Samples used.
    pub sample_count: usize,

    /// Limits with a safety margin over the forecast.
    pub recommended_limits: ResourceLimits,
}

/// Which limit a recommendation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// CPU percent.
    Cpu,

    /// Memory megabytes.
    Memory,
}

/// Direction of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    /// Lower the limit.
    Reduce,

    /// Raise the limit.
    Increase,
}

/// One proposed limit change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// The project.
    pub project_id: String,

    /// Which limit.
    pub resource: ResourceKind,

    /// Which way.
    pub action: RecommendationAction,

    /// Current limit.
    pub current: f64,

    /// Proposed limit.
    pub recommended: f64,

    /// `current - recommended`; negative for increases.
    pub estimated_savings: f64,

    /// Why.
    pub reason: String,
}

/// Recommendations across a set of projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    /// All recommendations.
    pub recommendations: Vec<Recommendation>,

    /// Total CPU percent freed by reductions minus that consumed by increases.
    pub total_cpu_savings: f64,

    /// Total memory megabytes freed by reductions minus that consumed by increases.
    pub total_memory_savings_mb: f64,

    /// Project ids ordered by relative savings, largest first.
    pub implementation_order: Vec<String>,

    /// Projects skipped for lack of history or allocation.
    pub skipped: Vec<String>,

    /// When the plan was made.
    pub generated_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Priority {
    /// Fraction of the requested maximum granted at this priority.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Normal => 0.6,
            Self::Low => 0.4,
            Self::Background => 0.2,
        }
    }

    /// Niceness used by process-level enforcement.
    pub fn niceness(&self) -> i32 {
        match self {
            Self::Critical | Self::High => 0,
            Self::Normal => 5,
            Self::Low => 10,
            Self::Background => 19,
        }
    }
}

impl ResourceRequirements {
    /// Checks that the ranges are well formed.
    pub fn validate(&self) -> MonoopsResult<()> {
        if !(self.min_cpu_percent >= 0.0 && self.max_cpu_percent <= 100.0) {
            return Err(MonoopsError::Validation(format!(
                "cpu range {}-{} must lie within 0-100",
                self.min_cpu_percent, self.max_cpu_percent
            )));
        }
        if self.min_cpu_percent > self.max_cpu_percent || self.max_cpu_percent <= 0.0 {
            return Err(MonoopsError::Validation(format!(
                "invalid cpu range {}-{}",
                self.min_cpu_percent, self.max_cpu_percent
            )));
        }
        if self.min_memory_mb > self.max_memory_mb || self.max_memory_mb == 0 {
            return Err(MonoopsError::Validation(format!(
                "invalid memory range {}-{}",
                self.min_memory_mb, self.max_memory_mb
            )));
        }
        if !(0.0..=100.0).contains(&self.scale_up_threshold) || self.scale_up_threshold == 0.0 {
            return Err(MonoopsError::Validation(format!(
                "scale-up threshold {} must lie within (0, 100]",
                self.scale_up_threshold
            )));
        }
        Ok(())
    }

    /// Checks that `limits` lie within the requested `[min, max]` windows.
    pub fn admits(&self, limits: &ResourceLimits) -> MonoopsResult<()> {
        if !(self.min_cpu_percent..=self.max_cpu_percent).contains(&limits.cpu_percent) {
            return Err(MonoopsError::Validation(format!(
                "cpu limit {} is outside the allocated range {}-{}",
                limits.cpu_percent, self.min_cpu_percent, self.max_cpu_percent
            )));
        }
        if !(self.min_memory_mb..=self.max_memory_mb).contains(&limits.memory_mb) {
            return Err(MonoopsError::Validation(format!(
                "memory limit {} MB is outside the allocated range {}-{}",
                limits.memory_mb, self.min_memory_mb, self.max_memory_mb
            )));
        }
        Ok(())
    }

    /// Requirements pinned to exactly `limits`.
    pub fn fixed(limits: &ResourceLimits) -> Self {
        Self {
            min_cpu_percent: limits.cpu_percent,
            max_cpu_percent: limits.cpu_percent,
            min_memory_mb: limits.memory_mb,
            max_memory_mb: limits.memory_mb,
            cpu_cores: limits.cpu_cores,
            disk_read_mbps: limits.disk_read_mbps,
            disk_write_mbps: limits.disk_write_mbps,
            max_processes: limits.max_processes,
            max_open_files: limits.max_open_files,
            ..Default::default()
        }
    }
}

impl ResourceLimits {
    /// Checks that the limits are usable.
    pub fn validate(&self) -> MonoopsResult<()> {
        if !(self.cpu_percent > 0.0 && self.cpu_percent <= 100.0) {
            return Err(MonoopsError::Validation(format!(
                "cpu limit {} must lie within (0, 100]",
                self.cpu_percent
            )));
        }
        if self.memory_mb == 0 {
            return Err(MonoopsError::Validation(
                "memory limit must be positive".to_string(),
            ));
        }
        if self.cpu_cores == Some(0) {
            return Err(MonoopsError::Validation(
                "cpu core count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            min_cpu_percent: 5.0,
            max_cpu_percent: 50.0,
            min_memory_mb: 128,
            max_memory_mb: 1024,
            cpu_cores: None,
            disk_read_mbps: None,
            disk_write_mbps: None,
            max_processes: None,
            max_open_files: None,
            priority: Priority::Normal,
            auto_scale: false,
            scale_up_threshold: DEFAULT_SCALE_UP_THRESHOLD,
        }
    }
}

impl fmt::Display for EnforcementMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Docker => "docker",
            Self::Cgroup => "cgroup",
            Self::Process => "process",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Priority {
    type Err = MonoopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" | "medium" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(MonoopsError::Validation(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
