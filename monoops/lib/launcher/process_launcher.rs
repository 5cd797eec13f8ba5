use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tokio::{
    fs,
    sync::{Mutex, RwLock},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{self, Settings, DEFAULT_ENVIRONMENT},
    environment::{self, EnvironmentManager},
    registry::{self, ProjectEntry, ProjectRegistry},
    resources::ResourceLimits,
    runtime::{self, ExitRegistry, SpawnSpec, SystemProbe},
    utils::{self, STARTUP_CONFIG_FILENAME},
    MonoopsError, MonoopsResult,
};

use super::{
    detect,
    health::{self, HealthMonitor},
    PortAllocator, ProcessInfo, ProcessStatus, ProjectStatus, RunningProject, StartupConfig,
    StopOutcome,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Lines of log output attached to a startup failure.
const STARTUP_FAILURE_LOG_LINES: usize = 20;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Starts, stops and watches project processes.
pub struct ProcessLauncher {
    settings: Settings,
    registry: Arc<dyn ProjectRegistry>,
    environments: Arc<EnvironmentManager>,
    ports: PortAllocator,
    probe: Arc<SystemProbe>,
    exits: ExitRegistry,
    http: reqwest::Client,

    /// Tracked projects keyed by id.
    projects: Arc<RwLock<HashMap<String, RunningProject>>>,

    /// Cancellation tokens of the per-project health monitors.
    monitors: Mutex<HashMap<String, CancellationToken>>,

    /// Serializes start and stop for the same project.
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessLauncher {
    /// Creates a launcher.
    pub fn new(
        settings: Settings,
        registry: Arc<dyn ProjectRegistry>,
        environments: Arc<EnvironmentManager>,
        probe: Arc<SystemProbe>,
    ) -> Self {
        let ports = PortAllocator::new(*settings.get_port_range_start()..=*settings.get_port_range_end());
        Self {
            settings,
            registry,
            environments,
            ports,
            probe,
            exits: ExitRegistry::new(),
            http: reqwest::Client::new(),
            projects: Arc::new(RwLock::new(HashMap::new())),
            monitors: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The port allocator.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// The project registry.
    pub fn registry(&self) -> &Arc<dyn ProjectRegistry> {
        &self.registry
    }

    /// Starts a project.
    ///
    /// `custom` overrides fields of the project's startup file. The environment defaults to
    /// `development`.
    pub async fn start(
        &self,
        project_id: &str,
        environment: Option<&str>,
        custom: Option<StartupConfig>,
    ) -> MonoopsResult<ProcessInfo> {
        let lock = self.op_lock(project_id).await;
        let _guard = lock.lock().await;

        // Another launcher may have started the project; its snapshot has the live pids.
        if !self.projects.read().await.contains_key(project_id) {
            self.adopt_snapshot(&self.state_path(project_id)).await?;
        }

        if let Some(existing) = self.refresh(project_id).await {
            if existing.status.is_active() {
                return Err(MonoopsError::AlreadyRunning(project_id.to_string()));
            }
            // A crashed or exited project is replaced.
            self.untrack(project_id).await;
        }

        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let environment = environment.unwrap_or(DEFAULT_ENVIRONMENT).to_string();

        let file_config: StartupConfig =
            config::load_project_config(&entry.path, STARTUP_CONFIG_FILENAME)
                .await?
                .unwrap_or_default();
        let startup = match custom {
            Some(custom) => file_config.merged_with(custom),
            None => file_config,
        };

        let ports = self.ports.allocate(
            project_id,
            &startup.ports,
            startup.port_count.unwrap_or(1),
        )?;

        match self.spawn_project(&entry, &environment, &startup, &ports).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.untrack(project_id).await;
                Err(e)
            }
        }
    }

    /// Stops a project, escalating to a forced kill after the grace period.
    ///
    /// Stopping a project that is not running succeeds without doing anything.
    pub async fn stop(&self, project_id: &str, graceful: bool) -> MonoopsResult<StopOutcome> {
        let lock = self.op_lock(project_id).await;
        let _guard = lock.lock().await;

        let project = {
            let mut projects = self.projects.write().await;
            projects.get_mut(project_id).map(|project| {
                project.status = ProjectStatus::Stopping;
                project.clone()
            })
        };

        let Some(project) = project else {
            return Ok(StopOutcome {
                success: true,
                status: ProjectStatus::Stopped,
                released_ports: Vec::new(),
                message: format!("{} is not running", project_id),
            });
        };

        self.cancel_monitor(project_id).await;

        let grace = self.settings.grace_period();
        let mut killed = 0;
        for pid in project.pids() {
            let outcome = runtime::terminate(pid, graceful, grace, &self.exits).await;
            tracing::debug!(project_id, pid, outcome = ?outcome, "terminated process");
            if outcome == runtime::TerminateOutcome::Killed {
                killed += 1;
            }
        }

        let released_ports = self.untrack(project_id).await;
        tracing::info!(project_id, graceful, ports = ?released_ports, "stopped project");

        Ok(StopOutcome {
            success: true,
            status: ProjectStatus::Stopped,
            released_ports,
            message: match killed {
                0 => format!("stopped {}", project_id),
                n => format!("stopped {} ({} process(es) force-killed)", project_id, n),
            },
        })
    }

    /// Stops then starts a project, keeping its environment unless `environment` is given.
    pub async fn restart(
        &self,
        project_id: &str,
        environment: Option<&str>,
        custom: Option<StartupConfig>,
    ) -> MonoopsResult<ProcessInfo> {
        let previous = self
            .projects
            .read()
            .await
            .get(project_id)
            .map(|p| p.environment.clone());

        self.stop(project_id, true).await?;
        time::sleep(self.settings.restart_settle_delay()).await;

        let environment = environment.map(str::to_string).or(previous);
        self.start(project_id, environment.as_deref(), custom).await
    }

    /// Returns a project's current state, re-polling its processes.
    ///
    /// An untracked project is reported as stopped.
    pub async fn get_status(&self, project_id: &str) -> MonoopsResult<RunningProject> {
        if let Some(project) = self.refresh(project_id).await {
            return Ok(project);
        }

        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let startup: StartupConfig = config::load_project_config(&entry.path, STARTUP_CONFIG_FILENAME)
            .await?
            .unwrap_or_default();
        let project_type =
            detect::resolve_project_type(&entry.path, entry.declared_type.as_deref(), &startup)
                .await;

        Ok(RunningProject::stopped(entry.id, entry.path, project_type))
    }

    /// Returns every tracked project, re-polling each.
    pub async fn list(&self) -> Vec<RunningProject> {
        let ids: Vec<String> = self.projects.read().await.keys().cloned().collect();
        let mut projects = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(project) = self.refresh(&id).await {
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    /// Returns the last `tail_lines` lines of a project's log.
    ///
    /// Reads the log of `environment`, else of the running environment, else of the default one.
    pub async fn get_logs(
        &self,
        project_id: &str,
        tail_lines: usize,
        environment: Option<&str>,
    ) -> MonoopsResult<Vec<String>> {
        let environment = match environment {
            Some(env) => env.to_string(),
            None => self
                .projects
                .read()
                .await
                .get(project_id)
                .map(|p| p.environment.clone())
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
        };

        let path = runtime::project_log_path(&self.settings.log_dir(), project_id, &environment);
        utils::tail_file(path, tail_lines).await
    }

    /// Pids of a project's tracked processes.
    pub async fn tracked_pids(&self, project_id: &str) -> Vec<u32> {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(RunningProject::pids)
            .unwrap_or_default()
    }

    /// Records the limits the allocator applied to a tracked project.
    pub async fn set_resource_limits(&self, project_id: &str, limits: ResourceLimits) {
        let changed = match self.projects.write().await.get_mut(project_id) {
            Some(project) => {
                project.resource_limits = Some(limits);
                true
            }
            None => false,
        };
        if changed {
            self.save_state(project_id).await;
        }
    }

    /// Re-adopts projects from state snapshots whose processes are still alive, and deletes the
    /// rest.
    pub async fn recover(&self) -> MonoopsResult<Vec<String>> {
        let state_dir = self.settings.state_dir();
        if !fs::try_exists(&state_dir).await? {
            return Ok(Vec::new());
        }

        let mut adopted = Vec::new();
        let mut entries = fs::read_dir(&state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            if let Some(id) = self.adopt_snapshot(&path).await? {
                adopted.push(id);
            }
        }

        Ok(adopted)
    }

    /// Tracks the project in a state snapshot if any of its processes are alive, and deletes
    /// the snapshot otherwise. Returns the adopted project's id.
    ///
    /// Adopted processes have no waiter, so their exit is reported as stopped rather than crashed.
    async fn adopt_snapshot(&self, path: &Path) -> MonoopsResult<Option<String>> {
        if !fs::try_exists(path).await? {
            return Ok(None);
        }

        let project: RunningProject = match fs::read_to_string(path)
            .await
            .map_err(MonoopsError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(MonoopsError::from))
        {
            Ok(project) => project,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable state file, removing");
                let _ = fs::remove_file(path).await;
                return Ok(None);
            }
        };

        let alive = project.pids().iter().any(|pid| utils::is_process_running(*pid));
        if !alive {
            tracing::info!(project_id = %project.id, "removing stale state file");
            let _ = fs::remove_file(path).await;
            return Ok(None);
        }

        let id = project.id.clone();
        if self.projects.read().await.contains_key(&id) {
            return Ok(None);
        }
        self.ports.reserve(&id, &project.ports());
        self.projects.write().await.insert(id.clone(), project);
        self.spawn_health_monitor(&id).await;
        tracing::info!(project_id = %id, "re-adopted running project");
        Ok(Some(id))
    }

    /// Stops every tracked project.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.projects.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id, true).await {
                tracing::error!(project_id = %id, error = %e, "failed to stop project on shutdown");
            }
        }
    }

    async fn spawn_project(
        &self,
        entry: &ProjectEntry,
        environment: &str,
        startup: &StartupConfig,
        ports: &[u16],
    ) -> MonoopsResult<ProcessInfo> {
        let project_id = entry.id.as_str();
        let primary_port = ports.first().copied().ok_or_else(|| {
            MonoopsError::PortUnavailable(format!("no port allocated for {}", project_id))
        })?;

        let project_type =
            detect::resolve_project_type(&entry.path, entry.declared_type.as_deref(), startup).await;
        let argv =
            detect::build_command(project_id, project_type, &entry.path, primary_port, startup)
                .await?;
        let envs = self.build_env(entry, environment, startup, ports).await?;

        let cwd = startup
            .working_dir
            .as_ref()
            .map(|dir| entry.path.join(dir))
            .unwrap_or_else(|| entry.path.clone());
        let log_path = runtime::project_log_path(&self.settings.log_dir(), project_id, environment);

        let pid = runtime::spawn_supervised(
            &SpawnSpec {
                argv: argv.clone(),
                cwd,
                envs,
                log_path: log_path.clone(),
            },
            &self.exits,
        )
        .await
        .map_err(|e| MonoopsError::StartupFailed {
            project_id: project_id.to_string(),
            reason: format!("spawn failed: {}", e),
        })?;

        let info = ProcessInfo {
            pid,
            name: argv
                .first()
                .and_then(|p| Path::new(p).file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            status: ProcessStatus::Running,
            cpu_percent: 0.0,
            memory_bytes: 0,
            ports: ports.to_vec(),
            command: argv,
            log_path: log_path.clone(),
            started_at: Utc::now(),
            exit_code: None,
        };

        let mut project = RunningProject::stopped(project_id, &entry.path, project_type);
        project.status = ProjectStatus::Starting;
        project.processes = vec![info.clone()];
        project.primary_port = Some(primary_port);
        project.health_url = health_url(startup, primary_port);
        project.environment = environment.to_string();
        project.started_at = Some(info.started_at);

        self.projects
            .write()
            .await
            .insert(project_id.to_string(), project);
        self.save_state(project_id).await;

        time::sleep(self.settings.startup_confirm_delay()).await;

        if self.exits.has_exited(pid) {
            let code = self.exits.get(pid).and_then(|r| r.code);
            let tail = utils::tail_file(&log_path, STARTUP_FAILURE_LOG_LINES)
                .await
                .unwrap_or_default();
            tracing::error!(project_id, pid, exit_code = ?code, "process exited during startup");
            return Err(MonoopsError::StartupFailed {
                project_id: project_id.to_string(),
                reason: format!(
                    "process exited during startup (exit code {:?})\n{}",
                    code,
                    tail.join("\n")
                ),
            });
        }

        if let Some(project) = self.projects.write().await.get_mut(project_id) {
            project.status = ProjectStatus::Running;
        }
        self.save_state(project_id).await;
        self.spawn_health_monitor(project_id).await;

        tracing::info!(
            project_id,
            pid,
            port = primary_port,
            environment,
            project_type = %project_type,
            "started project"
        );
        Ok(info)
    }

    /// Merges variables, lowest precedence first: active environment, env file, explicit config,
    /// then the allocated ports.
    async fn build_env(
        &self,
        entry: &ProjectEntry,
        environment: &str,
        startup: &StartupConfig,
        ports: &[u16],
    ) -> MonoopsResult<HashMap<String, String>> {
        let mut envs: HashMap<String, String> = self
            .environments
            .materialize_variables(&entry.id, environment)
            .await?
            .into_iter()
            .collect();

        if let Some(env_file) = &startup.env_file {
            let path = entry.path.join(env_file);
            if path.exists() {
                envs.extend(environment::parse_env_file(&path)?);
            } else {
                tracing::warn!(project_id = %entry.id, path = %path.display(), "env file not found");
            }
        }

        envs.extend(startup.env.clone());

        if let Some(port) = ports.first() {
            envs.insert("PORT".to_string(), port.to_string());
        }
        envs.insert(
            "PORTS".to_string(),
            ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        envs.insert("MONOOPS_PROJECT_ID".to_string(), entry.id.clone());
        envs.insert("MONOOPS_ENVIRONMENT".to_string(), environment.to_string());

        Ok(envs)
    }

    /// Re-polls a tracked project and returns a copy of it.
    async fn refresh(&self, project_id: &str) -> Option<RunningProject> {
        let (snapshot, changed) = {
            let mut projects = self.projects.write().await;
            let project = projects.get_mut(project_id)?;
            let before = project.status;
            health::refresh_project(project, &self.exits, &self.probe);
            (project.clone(), before != project.status)
        };

        if changed {
            tracing::info!(project_id, status = %snapshot.status, "project status changed");
            self.save_state(project_id).await;
        }
        Some(snapshot)
    }

    /// Stops tracking a project: cancels its monitor, releases its ports and removes its snapshot.
    async fn untrack(&self, project_id: &str) -> Vec<u16> {
        self.cancel_monitor(project_id).await;
        if let Some(project) = self.projects.write().await.remove(project_id) {
            for pid in project.pids() {
                self.exits.forget(pid);
            }
        }
        self.remove_state(project_id).await;
        self.ports.release(project_id)
    }

    async fn spawn_health_monitor(&self, project_id: &str) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .monitors
            .lock()
            .await
            .insert(project_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        HealthMonitor {
            project_id: project_id.to_string(),
            projects: self.projects.clone(),
            exits: self.exits.clone(),
            probe: self.probe.clone(),
            http: self.http.clone(),
            interval: self.settings.health_interval(),
            timeout: self.settings.health_check_timeout(),
            token,
        }
        .spawn();
    }

    async fn cancel_monitor(&self, project_id: &str) {
        if let Some(token) = self.monitors.lock().await.remove(project_id) {
            token.cancel();
        }
    }

    async fn op_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    fn state_path(&self, project_id: &str) -> PathBuf {
        self.settings.state_dir().join(format!("{}.json", project_id))
    }

    /// Writes the project's snapshot; failures are logged.
    async fn save_state(&self, project_id: &str) {
        let Some(project) = self.projects.read().await.get(project_id).cloned() else {
            return;
        };

        let path = self.state_path(project_id);
        let result = async {
            fs::create_dir_all(self.settings.state_dir()).await?;
            let json = serde_json::to_string_pretty(&project)?;
            fs::write(&path, json).await?;
            Ok::<_, MonoopsError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(project_id, path = %path.display(), error = %e, "failed to save runtime state");
        }
    }

    async fn remove_state(&self, project_id: &str) {
        let path = self.state_path(project_id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(project_id, path = %path.display(), error = %e, "failed to remove runtime state");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn health_url(startup: &StartupConfig, port: u16) -> Option<String> {
    if let Some(url) = &startup.health_url {
        return Some(url.clone());
    }
    startup.health_path.as_ref().map(|path| {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", port, path)
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::registry::{LocalRegistry, MemoryAuditStore};

    use super::*;

    async fn launcher(home: &Path, project: &Path) -> anyhow::Result<ProcessLauncher> {
        let registry = Arc::new(LocalRegistry::new());
        registry.register("app", project, None).await;
        let registry: Arc<dyn ProjectRegistry> = registry;

        let settings = Settings::builder()
            .home_dir(home)
            .startup_confirm_millis(300)
            .restart_settle_millis(50)
            .grace_period_secs(2)
            .health_interval_secs(1)
            .port_range_start(42000)
            .port_range_end(42999)
            .build();
        let environments = Arc::new(EnvironmentManager::new(
            registry.clone(),
            Arc::new(MemoryAuditStore::new()),
        ));

        Ok(ProcessLauncher::new(
            settings,
            registry,
            environments,
            Arc::new(SystemProbe::new()),
        ))
    }

    fn command(cmd: &str) -> StartupConfig {
        StartupConfig {
            command: Some(cmd.to_string()),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_start_stop_lifecycle() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let info = launcher
            .start("app", None, Some(command("echo port=$PORT; sleep 30")))
            .await?;
        assert_eq!(info.ports.len(), 1);

        let status = launcher.get_status("app").await?;
        assert_eq!(*status.get_status(), ProjectStatus::Running);
        assert_eq!(status.get_environment(), DEFAULT_ENVIRONMENT);
        assert!(home.path().join("state/app.json").exists());

        let err = launcher.start("app", None, None).await.unwrap_err();
        assert!(matches!(err, MonoopsError::AlreadyRunning(_)));

        let outcome = launcher.stop("app", true).await?;
        assert!(outcome.success);
        assert_eq!(outcome.released_ports, info.ports);
        assert!(launcher.ports().ports_of("app").is_empty());
        assert!(!home.path().join("state/app.json").exists());

        let logs = launcher.get_logs("app", 10, None).await?;
        assert!(logs
            .iter()
            .any(|l| l == &format!("port={}", info.ports[0])));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_restart_keeps_environment_unless_overridden() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let first = launcher
            .start("app", Some("staging"), Some(command("sleep 30")))
            .await?;

        let second = launcher
            .restart("app", None, Some(command("sleep 30")))
            .await?;
        assert_ne!(second.pid, first.pid);
        let status = launcher.get_status("app").await?;
        assert_eq!(*status.get_status(), ProjectStatus::Running);
        assert_eq!(status.get_environment(), "staging");
        assert_eq!(status.pids(), vec![second.pid]);

        let third = launcher
            .restart("app", Some("production"), Some(command("sleep 30")))
            .await?;
        assert_ne!(third.pid, second.pid);
        assert_eq!(launcher.get_status("app").await?.get_environment(), "production");

        launcher.stop("app", false).await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_start_refuses_project_running_under_another_launcher() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let first = launcher(home.path(), project.path()).await?;
        let second = launcher(home.path(), project.path()).await?;

        let info = first
            .start("app", None, Some(command("sleep 30")))
            .await?;

        let err = second
            .start("app", None, Some(command("sleep 30")))
            .await
            .unwrap_err();
        assert!(matches!(err, MonoopsError::AlreadyRunning(_)));
        assert_eq!(second.tracked_pids("app").await, vec![info.pid]);

        first.stop("app", true).await?;

        // Once the other launcher stops it, the project can be started here.
        let restarted = second
            .start("app", None, Some(command("sleep 30")))
            .await?;
        assert_ne!(restarted.pid, info.pid);
        second.stop("app", false).await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_health_monitor_polls_health_url() -> anyhow::Result<()> {
        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        };

        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/health", listener.local_addr()?);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            }
        });

        let startup = StartupConfig {
            command: Some("sleep 30".into()),
            health_url: Some(url),
            ..Default::default()
        };
        launcher.start("app", None, Some(startup)).await?;

        time::sleep(Duration::from_millis(2500)).await;
        let status = launcher.get_status("app").await?;
        assert_eq!(*status.get_last_health_ok(), Some(true));
        assert!(status.get_last_health_check().is_some());

        launcher.stop("app", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_health_check_reports_refused_and_error_statuses() -> anyhow::Result<()> {
        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/health", listener.local_addr()?);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let http = reqwest::Client::new();
        assert!(!health::check_http(&http, &url, Duration::from_secs(2)).await);

        let closed = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let refused = format!("http://{}/health", closed);
        assert!(!health::check_http(&http, &refused, Duration::from_secs(2)).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let first = launcher.stop("app", true).await?;
        let second = launcher.stop("app", false).await?;
        assert!(first.success && second.success);
        assert_eq!(second.status, ProjectStatus::Stopped);
        assert!(launcher.ports().snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_immediate_exit_is_startup_failure() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let err = launcher
            .start("app", Some("staging"), Some(command("echo boom; exit 1")))
            .await
            .unwrap_err();
        assert!(matches!(err, MonoopsError::StartupFailed { .. }));
        assert!(launcher.ports().ports_of("app").is_empty());
        assert!(launcher.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_is_reported() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        launcher
            .start("app", None, Some(command("sleep 1; exit 7")))
            .await?;
        time::sleep(Duration::from_millis(1500)).await;

        let status = launcher.get_status("app").await?;
        assert_eq!(*status.get_status(), ProjectStatus::Crashed);
        assert_eq!(status.get_processes()[0].exit_code, Some(7));

        // A crashed project can be started again.
        launcher
            .start("app", None, Some(command("sleep 30")))
            .await?;
        launcher.stop("app", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let err = launcher.start("ghost", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_unrunnable_project_fails_to_start() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let project = tempfile::tempdir()?;
        let launcher = launcher(home.path(), project.path()).await?;

        let err = launcher.start("app", None, None).await.unwrap_err();
        assert!(matches!(err, MonoopsError::StartupFailed { .. }));
        assert!(launcher.ports().snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn test_health_url_from_path() {
        let startup = StartupConfig {
            health_path: Some("/health".into()),
            ..Default::default()
        };
        assert_eq!(
            health_url(&startup, 4000).as_deref(),
            Some("http://127.0.0.1:4000/health")
        );
        assert_eq!(health_url(&StartupConfig::default(), 4000), None);
    }
}
