use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    utils::{
        self, AUDIT_SUBDIR, BACKUPS_SUBDIR, DEPLOYMENTS_SUBDIR, LOG_SUBDIR, SETTINGS_FILENAME,
        STATE_SUBDIR,
    },
    MonoopsResult,
};

use super::{
    DEFAULT_AUTOSCALE_INTERVAL_SECS, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_GRACE_PERIOD_SECS,
    DEFAULT_HEALTH_CHECK_TIMEOUT_SECS, DEFAULT_HEALTH_INTERVAL_SECS,
    DEFAULT_MAX_CONCURRENT_BACKUPS, DEFAULT_MAX_CONCURRENT_DEPLOYMENTS,
    DEFAULT_METRICS_RETENTION_DAYS, DEFAULT_MONITOR_INTERVAL_SECS, DEFAULT_PORT_RANGE_END,
    DEFAULT_PORT_RANGE_START, DEFAULT_RESTART_SETTLE_MILLIS, DEFAULT_SCHEDULER_INTERVAL_SECS,
    DEFAULT_STARTUP_CONFIRM_MILLIS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Host-wide settings shared by every component.
///
/// Loaded from `$MONOOPS_HOME/monoops.yaml`; every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters, PartialEq)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct Settings {
    /// Where monoops keeps logs, state, deployments and backups.
    #[serde(skip)]
    #[builder(default = utils::get_monoops_home_path(), setter(into))]
    home_dir: PathBuf,

    /// Directory whose subdirectories are treated as projects.
    #[builder(default, setter(strip_option, into))]
    projects_root: Option<PathBuf>,

    /// First port of the allocation range.
    #[builder(default = DEFAULT_PORT_RANGE_START)]
    port_range_start: u16,

    /// Last port of the allocation range.
    #[builder(default = DEFAULT_PORT_RANGE_END)]
    port_range_end: u16,

    /// Seconds between SIGTERM and SIGKILL.
    #[builder(default = DEFAULT_GRACE_PERIOD_SECS)]
    grace_period_secs: u64,

    /// Milliseconds to wait before confirming a spawned process survived.
    #[builder(default = DEFAULT_STARTUP_CONFIRM_MILLIS)]
    startup_confirm_millis: u64,

    /// Milliseconds between stop and start during a restart.
    #[builder(default = DEFAULT_RESTART_SETTLE_MILLIS)]
    restart_settle_millis: u64,

    /// Seconds between health monitor polls.
    #[builder(default = DEFAULT_HEALTH_INTERVAL_SECS)]
    health_interval_secs: u64,

    /// Seconds between resource samples.
    #[builder(default = DEFAULT_MONITOR_INTERVAL_SECS)]
    monitor_interval_secs: u64,

    /// Seconds between auto-scale evaluations.
    #[builder(default = DEFAULT_AUTOSCALE_INTERVAL_SECS)]
    autoscale_interval_secs: u64,

    /// Seconds between backup scheduler wake-ups.
    #[builder(default = DEFAULT_SCHEDULER_INTERVAL_SECS)]
    scheduler_interval_secs: u64,

    /// Upper bound for build, test, deploy and dump commands.
    #[builder(default = DEFAULT_COMMAND_TIMEOUT_SECS)]
    command_timeout_secs: u64,

    /// Upper bound for a single health check.
    #[builder(default = DEFAULT_HEALTH_CHECK_TIMEOUT_SECS)]
    health_check_timeout_secs: u64,

    /// Maximum simultaneous deployments.
    #[builder(default = DEFAULT_MAX_CONCURRENT_DEPLOYMENTS)]
    max_concurrent_deployments: usize,

    /// Maximum simultaneous backups.
    #[builder(default = DEFAULT_MAX_CONCURRENT_BACKUPS)]
    max_concurrent_backups: usize,

    /// Days of resource samples to keep.
    #[builder(default = DEFAULT_METRICS_RETENTION_DAYS)]
    metrics_retention_days: i64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Settings {
    /// Loads settings from `home_dir/monoops.yaml`, falling back to defaults when absent.
    pub async fn load(home_dir: impl AsRef<Path>) -> MonoopsResult<Self> {
        let home_dir = home_dir.as_ref().to_path_buf();
        let path = home_dir.join(SETTINGS_FILENAME);

        let mut settings = if fs::try_exists(&path).await? {
            let contents = fs::read_to_string(&path).await?;
            serde_yaml::from_str::<Settings>(&contents)?
        } else {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            Settings::default()
        };

        settings.home_dir = home_dir;
        Ok(settings)
    }

    /// Loads settings from the home directory resolved from `MONOOPS_HOME`.
    pub async fn load_default() -> MonoopsResult<Self> {
        Self::load(utils::get_monoops_home_path()).await
    }

    /// Directory holding per-project process logs.
    pub fn log_dir(&self) -> PathBuf {
        self.home_dir.join(LOG_SUBDIR)
    }

    /// Directory holding runtime state snapshots.
    pub fn state_dir(&self) -> PathBuf {
        self.home_dir.join(STATE_SUBDIR)
    }

    /// Directory holding deployment workspaces.
    pub fn deployments_dir(&self) -> PathBuf {
        self.home_dir.join(DEPLOYMENTS_SUBDIR)
    }

    /// Root of backup storage.
    pub fn backups_dir(&self) -> PathBuf {
        self.home_dir.join(BACKUPS_SUBDIR)
    }

    /// Directory holding audit records.
    pub fn audit_dir(&self) -> PathBuf {
        self.home_dir.join(AUDIT_SUBDIR)
    }

    /// The SIGTERM to SIGKILL grace period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// The startup confirmation delay.
    pub fn startup_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.startup_confirm_millis)
    }

    /// The restart settle delay.
    pub fn restart_settle_delay(&self) -> Duration {
        Duration::from_millis(self.restart_settle_millis)
    }

    /// The health monitor interval.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// The resource monitor interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// The auto-scale interval.
    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }

    /// The backup scheduler interval.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    /// The external command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The health check timeout.
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Settings {
    fn default() -> Self {
        Settings::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_load_defaults_when_missing() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let settings = Settings::load(home.path()).await?;

        assert_eq!(settings.get_home_dir(), home.path());
        assert_eq!(*settings.get_port_range_start(), 3000);
        assert_eq!(*settings.get_port_range_end(), 9999);
        assert_eq!(settings.grace_period(), Duration::from_secs(10));
        assert_eq!(*settings.get_max_concurrent_backups(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_settings_partial_file_overrides() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        std::fs::write(
            home.path().join(SETTINGS_FILENAME),
            "port_range_start: 4000\nmax_concurrent_deployments: 1\n",
        )?;

        let settings = Settings::load(home.path()).await?;

        assert_eq!(*settings.get_port_range_start(), 4000);
        assert_eq!(*settings.get_port_range_end(), 9999);
        assert_eq!(*settings.get_max_concurrent_deployments(), 1);
        assert_eq!(settings.backups_dir(), home.path().join("backups"));
        Ok(())
    }
}
