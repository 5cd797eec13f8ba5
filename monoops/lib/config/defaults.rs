use std::{path::PathBuf, sync::LazyLock};

use crate::utils::MONOOPS_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The first port scanned when a project needs one allocated.
pub const DEFAULT_PORT_RANGE_START: u16 = 3000;

/// The last port scanned when a project needs one allocated.
pub const DEFAULT_PORT_RANGE_END: u16 = 9999;

/// How long a stopping process gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// The delay before the launcher confirms a freshly spawned process is still alive.
pub const DEFAULT_STARTUP_CONFIRM_MILLIS: u64 = 2000;

/// The delay between the stop and start halves of a restart.
pub const DEFAULT_RESTART_SETTLE_MILLIS: u64 = 1000;

/// How often the health monitor polls a running project.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// How often the resource monitor samples a project's usage.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;

/// How often the auto-scaler re-evaluates an allocation.
pub const DEFAULT_AUTOSCALE_INTERVAL_SECS: u64 = 60;

/// How often the backup scheduler wakes up.
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;

/// Upper bound on any single external command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Upper bound on a single health check.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;

/// Maximum simultaneous deployments.
pub const DEFAULT_MAX_CONCURRENT_DEPLOYMENTS: usize = 3;

/// Maximum simultaneous backups.
pub const DEFAULT_MAX_CONCURRENT_BACKUPS: usize = 3;

/// How long resource samples are kept.
pub const DEFAULT_METRICS_RETENTION_DAYS: i64 = 30;

/// The environment used when none is specified.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// The path where all monoops global data is stored.
pub static DEFAULT_MONOOPS_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(MONOOPS_HOME_DIR)
});
