use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::RwLock, time};
use tokio_util::sync::CancellationToken;

use crate::{
    runtime::{ExitRegistry, SystemProbe},
    utils,
};

use super::{ProcessStatus, ProjectStatus, RunningProject};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Background loop that keeps one project's process state fresh and polls its health URL.
pub(super) struct HealthMonitor {
    pub(super) project_id: String,
    pub(super) projects: Arc<RwLock<HashMap<String, RunningProject>>>,
    pub(super) exits: ExitRegistry,
    pub(super) probe: Arc<SystemProbe>,
    pub(super) http: reqwest::Client,
    pub(super) interval: Duration,
    pub(super) timeout: Duration,
    pub(super) token: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HealthMonitor {
    /// Runs the loop on the tokio runtime.
    pub(super) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let project_id = self.project_id.as_str();
        tracing::debug!(project_id, "health monitor started");
        let mut reported_crash = false;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = time::sleep(self.interval) => {}
            }

            let health_url = {
                let mut projects = self.projects.write().await;
                let Some(project) = projects.get_mut(project_id) else {
                    break;
                };

                refresh_project(project, &self.exits, &self.probe);

                if project.status == ProjectStatus::Crashed && !reported_crash {
                    reported_crash = true;
                    tracing::error!(
                        project_id,
                        exit_codes = ?project.processes.iter().map(|p| p.exit_code).collect::<Vec<_>>(),
                        "project crashed"
                    );
                }

                match project.status {
                    ProjectStatus::Running => project.health_url.clone(),
                    _ => None,
                }
            };

            let Some(url) = health_url else {
                continue;
            };

            let healthy = check_http(&self.http, &url, self.timeout).await;
            if !healthy {
                tracing::warn!(project_id, url, "health check failed");
            }

            if let Some(project) = self.projects.write().await.get_mut(project_id) {
                project.last_health_ok = Some(healthy);
                project.last_health_check = Some(Utc::now());
            }
        }

        tracing::debug!(project_id, "health monitor stopped");
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Re-polls every process of `project` and recomputes its status.
///
/// A process with an exit record is stopped when it exited cleanly and crashed otherwise; one the
/// OS no longer knows about is stopped.
pub(super) fn refresh_project(project: &mut RunningProject, exits: &ExitRegistry, probe: &SystemProbe) {
    if project.status == ProjectStatus::Stopping {
        return;
    }

    for process in project.processes.iter_mut() {
        if matches!(process.status, ProcessStatus::Stopped | ProcessStatus::Crashed) {
            continue;
        }

        if let Some(record) = exits.get(process.pid) {
            process.status = if record.is_clean() {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Crashed
            };
            process.exit_code = record.code;
            continue;
        }

        match probe.process(process.pid) {
            Some(sample) => {
                process.status = ProcessStatus::Running;
                process.cpu_percent = sample.cpu_percent;
                process.memory_bytes = sample.memory_bytes;
            }
            None if utils::is_process_running(process.pid) => {
                process.status = ProcessStatus::Unknown;
            }
            None => process.status = ProcessStatus::Stopped,
        }
    }

    project.aggregate_status();
}

/// Issues a GET against `url`, returning whether it answered 2xx within `timeout`.
pub(super) async fn check_http(http: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match http.get(url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!(url, error = %e, "health request failed");
            false
        }
    }
}
