use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::{
    fs,
    sync::{Mutex, OnceCell, RwLock},
};

use crate::{
    config::{self, Settings, DEFAULT_ENVIRONMENT},
    environment::{self, EnvironmentManager},
    registry::{self, record_audit, AuditKind, AuditStore, ProjectEntry, ProjectRegistry},
    utils::{self, OperationSlots, BLUE_GREEN_FILENAME, DEPLOY_CONFIG_FILENAME, PRIMARY_ENV_FILENAME},
    MonoopsError, MonoopsResult,
};

use super::{
    health, BlueGreenOutcome, BlueGreenRecord, CheckOutcome, DeploymentConfig, DeploymentResult,
    DeploymentStatus, HealthCheck, HealthReport, HealthStatus, DEPLOY_EXCLUDES,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound for reading the source commit.
const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output lines kept in the deployment log per stage.
const STAGE_LOG_LINES: usize = 50;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs deployment pipelines, rollbacks and blue-green cycles.
///
/// Every deployment runs in its own copy of the project under
/// `$MONOOPS_HOME/deployments/<project>/<id>/`, and its result is persisted next to that
/// directory as `<id>.json` so later processes can roll back to it.
pub struct DeploymentAssistant {
    settings: Settings,
    registry: Arc<dyn ProjectRegistry>,
    environments: Arc<EnvironmentManager>,
    audit: Arc<dyn AuditStore>,
    http: reqwest::Client,
    slots: OperationSlots,

    /// Deployment results keyed by id.
    deployments: RwLock<HashMap<String, DeploymentResult>>,

    /// Set once persisted results have been read back.
    loaded: OnceCell<()>,

    /// Serializes blue-green cycles.
    blue_green: Mutex<()>,
}

/// Where a pipeline takes its sources from and which stages it runs.
struct PipelineSource<'a> {
    path: &'a Path,
    excludes: Vec<String>,
    rebuild: bool,
    extra_env: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeploymentAssistant {
    /// Creates an assistant.
    pub fn new(
        settings: Settings,
        registry: Arc<dyn ProjectRegistry>,
        environments: Arc<EnvironmentManager>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let slots = OperationSlots::new("deployment", *settings.get_max_concurrent_deployments());
        Self {
            settings,
            registry,
            environments,
            audit,
            http: reqwest::Client::new(),
            slots,
            deployments: RwLock::new(HashMap::new()),
            loaded: OnceCell::new(),
            blue_green: Mutex::new(()),
        }
    }

    /// Runs the pipeline for a project.
    ///
    /// `config` replaces the project's `.monoops/deploy.yaml`. Stage failures and unhealthy
    /// deployments are reported through the returned result, not as errors. When the pipeline
    /// fails and auto-rollback is enabled, the returned result is the original deployment after
    /// the rollback attempt.
    pub async fn deploy(
        &self,
        project_id: &str,
        target: &str,
        environment: Option<&str>,
        config: Option<DeploymentConfig>,
    ) -> MonoopsResult<DeploymentResult> {
        let _slot = self.slots.try_acquire()?;
        self.ensure_loaded().await?;

        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let config = self.resolve_config(&entry, config).await?;
        let environment = environment.unwrap_or(DEFAULT_ENVIRONMENT);

        self.execute(&entry, target, environment, &config, HashMap::new())
            .await
    }

    /// Re-applies the most recent successful deployment before `deployment_id` and marks
    /// `deployment_id` as rolled back. Returns the new rollback deployment.
    pub async fn rollback(&self, deployment_id: &str) -> MonoopsResult<DeploymentResult> {
        let _slot = self.slots.try_acquire()?;
        self.ensure_loaded().await?;

        let original = self.get_deployment_status(deployment_id).await?;
        let entry = registry::resolve_project(self.registry.as_ref(), &original.project_id).await?;
        let config = self.resolve_config(&entry, None).await?;

        self.rollback_inner(deployment_id, &config).await
    }

    /// Runs health checks against a project in place.
    ///
    /// Uses the project's configured checks when `checks` is `None`.
    pub async fn run_health_checks(
        &self,
        project_id: &str,
        checks: Option<Vec<HealthCheck>>,
    ) -> MonoopsResult<HealthReport> {
        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let checks = match checks {
            Some(checks) => checks,
            None => self.resolve_config(&entry, None).await?.health_checks,
        };

        let report = health::evaluate_checks(
            &self.http,
            &checks,
            &entry.path,
            &HashMap::new(),
            self.settings.health_check_timeout(),
        )
        .await;

        tracing::info!(project_id, status = %report.status, checks = checks.len(), "health checks finished");
        Ok(report)
    }

    /// Deployments newest first, optionally for one project.
    pub async fn list_deployments(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> MonoopsResult<Vec<DeploymentResult>> {
        self.ensure_loaded().await?;

        let mut deployments: Vec<DeploymentResult> = self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| project_id.map_or(true, |id| d.project_id == id))
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        deployments.truncate(limit);
        Ok(deployments)
    }

    /// Returns one deployment.
    pub async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> MonoopsResult<DeploymentResult> {
        self.ensure_loaded().await?;
        self.deployments
            .read()
            .await
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| MonoopsError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Deploys to the inactive instance of a (project, environment) pair and moves traffic to it
    /// only if the deployment comes out healthy. The previously active instance is left alone.
    pub async fn deploy_blue_green(
        &self,
        project_id: &str,
        environment: Option<&str>,
        config: Option<DeploymentConfig>,
    ) -> MonoopsResult<BlueGreenOutcome> {
        let _slot = self.slots.try_acquire()?;
        let _cycle = self.blue_green.lock().await;
        self.ensure_loaded().await?;

        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let mut config = self.resolve_config(&entry, config).await?;
        // The active instance is the fallback.
        config.auto_rollback_on_failure = false;
        let environment = environment.unwrap_or(DEFAULT_ENVIRONMENT);

        let mut records = self.load_blue_green().await?;
        let key = format!("{}/{}", project_id, environment);
        let mut record = records
            .remove(&key)
            .unwrap_or_else(|| BlueGreenRecord::new(project_id, environment));
        let instance = record.inactive();

        let extra_env = HashMap::from([("MONOOPS_INSTANCE".to_string(), instance.to_string())]);
        let deployment = self
            .execute(&entry, &instance.to_string(), environment, &config, extra_env)
            .await?;

        record.set_deployment(instance, &deployment.id);
        let switched = deployment.status == DeploymentStatus::Success;
        if switched {
            record.active = Some(instance);
            record.switched_at = Some(Utc::now());
            tracing::info!(project_id, environment, %instance, "switched traffic");
        } else {
            tracing::warn!(
                project_id,
                environment,
                %instance,
                active = ?record.active,
                "blue-green deployment unhealthy, traffic unchanged"
            );
        }

        records.insert(key, record.clone());
        self.save_blue_green(&records).await?;

        Ok(BlueGreenOutcome {
            deployment,
            instance,
            switched,
            record,
        })
    }

    /// Returns the blue-green record of a (project, environment) pair, if one exists.
    pub async fn get_blue_green(
        &self,
        project_id: &str,
        environment: &str,
    ) -> MonoopsResult<Option<BlueGreenRecord>> {
        Ok(self
            .load_blue_green()
            .await?
            .remove(&format!("{}/{}", project_id, environment)))
    }

    async fn execute(
        &self,
        entry: &ProjectEntry,
        target: &str,
        environment: &str,
        config: &DeploymentConfig,
        extra_env: HashMap<String, String>,
    ) -> MonoopsResult<DeploymentResult> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut result = DeploymentResult::new(
            &entry.id,
            target,
            environment,
            self.workspace_dir(&entry.id, &id),
            id,
        );
        result.commit_hash = git_commit(&entry.path).await;
        result.log(format!(
            "deploying {} to {} with environment {}{}",
            entry.id,
            target,
            environment,
            result
                .commit_hash
                .as_deref()
                .map(|c| format!(" at {}", c))
                .unwrap_or_default()
        ));

        let excludes = DEPLOY_EXCLUDES
            .iter()
            .map(|s| s.to_string())
            .chain(config.exclude.iter().cloned())
            .collect();

        let source = PipelineSource {
            path: &entry.path,
            excludes,
            rebuild: true,
            extra_env,
        };
        let result = self.run_pipeline(result, &source, config).await?;

        if result.status == DeploymentStatus::Failed && config.auto_rollback_on_failure {
            tracing::info!(deployment_id = %result.id, "auto-rollback triggered");
            if let Err(e) = self.rollback_inner(&result.id, config).await {
                tracing::warn!(deployment_id = %result.id, error = %e, "auto-rollback failed");
                let mut original = self.get_deployment_status(&result.id).await?;
                original.log(format!("auto-rollback failed: {}", e));
                self.store(&original).await?;
            }
            return self.get_deployment_status(&result.id).await;
        }

        Ok(result)
    }

    async fn rollback_inner(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> MonoopsResult<DeploymentResult> {
        let mut original = self.get_deployment_status(deployment_id).await?;

        let prior = self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| {
                d.project_id == original.project_id
                    && d.id != original.id
                    && d.status == DeploymentStatus::Success
                    && d.started_at <= original.started_at
            })
            .max_by_key(|d| d.started_at)
            .cloned()
            .ok_or_else(|| MonoopsError::NoPriorDeployment(original.project_id.clone()))?;

        let previous_status = original.status;
        original.status = DeploymentStatus::RollingBack;
        original.log(format!("rolling back to {}", prior.id));
        self.store(&original).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut rollback = DeploymentResult::new(
            &original.project_id,
            &original.target,
            &original.environment,
            self.workspace_dir(&original.project_id, &id),
            id,
        );
        rollback.commit_hash = prior.commit_hash.clone();
        rollback.rollback_of = Some(original.id.clone());
        rollback.source_deployment_id = Some(prior.id.clone());
        rollback.log(format!(
            "re-applying deployment {}{}",
            prior.id,
            prior
                .commit_hash
                .as_deref()
                .map(|c| format!(" at {}", c))
                .unwrap_or_default()
        ));

        let source = PipelineSource {
            path: &prior.workspace,
            excludes: Vec::new(),
            rebuild: false,
            extra_env: HashMap::new(),
        };
        let rollback = self.run_pipeline(rollback, &source, config).await?;

        original.rollback_deployment_id = Some(rollback.id.clone());
        if rollback.status == DeploymentStatus::Success {
            original.status = DeploymentStatus::RolledBack;
            original.log(format!("rolled back by {}", rollback.id));
        } else {
            original.status = if previous_status.is_terminal() {
                previous_status
            } else {
                DeploymentStatus::Failed
            };
            original.log(format!("rollback {} failed", rollback.id));
        }
        original.finished_at.get_or_insert_with(Utc::now);
        self.store(&original).await?;
        record_audit(&self.audit, AuditKind::Deployment, &original.project_id, &original);

        tracing::info!(
            deployment_id,
            rollback_id = %rollback.id,
            status = %rollback.status,
            "rollback finished"
        );
        Ok(rollback)
    }

    /// Runs prepare, build, test, deploy and the health check. Stage failures end the pipeline
    /// in `Failed`; only bookkeeping failures are errors.
    async fn run_pipeline(
        &self,
        mut result: DeploymentResult,
        source: &PipelineSource<'_>,
        config: &DeploymentConfig,
    ) -> MonoopsResult<DeploymentResult> {
        let deployment_id = result.id.clone();
        let timeout = config
            .stage_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.settings.command_timeout());

        result.status = DeploymentStatus::Preparing;
        self.store(&result).await?;

        let envs = match self.prepare(&mut result, source).await {
            Ok(envs) => envs,
            Err(e) => {
                result.fail(format!("prepare: {}", e));
                return self.finish(result).await;
            }
        };

        let stages = [
            (DeploymentStatus::Building, &config.build_command, source.rebuild),
            (DeploymentStatus::Testing, &config.test_command, source.rebuild),
            (DeploymentStatus::Deploying, &config.deploy_command, true),
        ];

        for (stage, command, enabled) in stages {
            result.status = stage;
            let Some(command) = command.as_deref().filter(|_| enabled) else {
                result.log(format!("{}: skipped", stage));
                continue;
            };

            result.log(format!("{}: {}", stage, command));
            self.store(&result).await?;
            tracing::info!(%deployment_id, %stage, command, "running stage");

            match utils::run_shell(command, &result.workspace, &envs, timeout).await {
                Ok(output) => {
                    let combined = output.combined();
                    let lines: Vec<&str> = combined.lines().collect();
                    for line in &lines[lines.len().saturating_sub(STAGE_LOG_LINES)..] {
                        result.logs.push(format!("  {}", line));
                    }
                    if !output.success() {
                        let code = output
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "signal".into());
                        result.fail(format!("{} exited with {}", stage, code));
                        return self.finish(result).await;
                    }
                }
                Err(e) => {
                    result.fail(format!("{}: {}", stage, e));
                    return self.finish(result).await;
                }
            }

            if stage == DeploymentStatus::Building {
                result.artifacts = collect_artifacts(&result.workspace, &config.artifacts);
                if !result.artifacts.is_empty() {
                    result.log(format!("{} artifacts", result.artifacts.len()));
                }
            }
        }

        let report = health::evaluate_checks(
            &self.http,
            &config.health_checks,
            &result.workspace,
            &envs,
            self.settings.health_check_timeout(),
        )
        .await;
        result.health_status = report.status;
        result.health_results = report.results;
        result.log(format!("health: {}", result.health_status));

        if result.health_status == HealthStatus::Unhealthy {
            let failed: Vec<String> = result
                .health_results
                .iter()
                .filter(|r| r.outcome == CheckOutcome::Fail)
                .map(|r| r.message.clone())
                .collect();
            result.fail(format!("health check failed: {}", failed.join("; ")));
        } else {
            result.status = DeploymentStatus::Success;
            result.finished_at = Some(Utc::now());
        }

        self.finish(result).await
    }

    /// Copies sources into the workspace and writes the env file. Returns the stage environment.
    async fn prepare(
        &self,
        result: &mut DeploymentResult,
        source: &PipelineSource<'_>,
    ) -> MonoopsResult<HashMap<String, String>> {
        if fs::try_exists(&result.workspace).await? {
            fs::remove_dir_all(&result.workspace).await?;
        }
        fs::create_dir_all(&result.workspace).await?;

        let excludes: Vec<&str> = source.excludes.iter().map(String::as_str).collect();
        let copied = utils::copy_dir_filtered(source.path, &result.workspace, &excludes).await?;
        result.log(format!("copied {} files from {}", copied, source.path.display()));

        let mut variables: BTreeMap<String, String> = self
            .environments
            .materialize_variables(&result.project_id, &result.environment)
            .await?;
        variables.insert("MONOOPS_PROJECT_ID".into(), result.project_id.clone());
        variables.insert("MONOOPS_ENVIRONMENT".into(), result.environment.clone());
        variables.insert("MONOOPS_DEPLOYMENT_ID".into(), result.id.clone());
        variables.insert("MONOOPS_TARGET".into(), result.target.clone());
        variables.extend(source.extra_env.clone());

        fs::write(
            result.workspace.join(PRIMARY_ENV_FILENAME),
            environment::render_env_file(&variables),
        )
        .await?;
        result.log(format!("wrote {} variables", variables.len()));

        Ok(variables.into_iter().collect())
    }

    async fn finish(&self, result: DeploymentResult) -> MonoopsResult<DeploymentResult> {
        self.store(&result).await?;
        if result.status.is_terminal() {
            record_audit(&self.audit, AuditKind::Deployment, &result.project_id, &result);
            tracing::info!(
                deployment_id = %result.id,
                project_id = %result.project_id,
                status = %result.status,
                health = %result.health_status,
                "deployment finished"
            );
        }
        Ok(result)
    }

    async fn resolve_config(
        &self,
        entry: &ProjectEntry,
        config: Option<DeploymentConfig>,
    ) -> MonoopsResult<DeploymentConfig> {
        match config {
            Some(config) => Ok(config),
            None => Ok(config::load_project_config(&entry.path, DEPLOY_CONFIG_FILENAME)
                .await?
                .unwrap_or_default()),
        }
    }

    fn workspace_dir(&self, project_id: &str, deployment_id: &str) -> PathBuf {
        self.settings
            .deployments_dir()
            .join(project_id)
            .join(deployment_id)
    }

    /// Records the latest state in memory and on disk.
    async fn store(&self, result: &DeploymentResult) -> MonoopsResult<()> {
        self.deployments
            .write()
            .await
            .insert(result.id.clone(), result.clone());

        let dir = self.settings.deployments_dir().join(&result.project_id);
        fs::create_dir_all(&dir).await?;
        fs::write(
            dir.join(format!("{}.json", result.id)),
            serde_json::to_vec_pretty(result)?,
        )
        .await?;
        Ok(())
    }

    /// Reads persisted results once per assistant.
    async fn ensure_loaded(&self) -> MonoopsResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let loaded = load_persisted(&self.settings.deployments_dir()).await?;
                let count = loaded.len();
                let mut deployments = self.deployments.write().await;
                for result in loaded {
                    deployments.entry(result.id.clone()).or_insert(result);
                }
                tracing::debug!(count, "loaded deployment history");
                Ok::<_, MonoopsError>(())
            })
            .await?;
        Ok(())
    }

    async fn load_blue_green(&self) -> MonoopsResult<HashMap<String, BlueGreenRecord>> {
        let path = self.settings.deployments_dir().join(BLUE_GREEN_FILENAME);
        if !fs::try_exists(&path).await? {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_slice(&fs::read(&path).await?)?)
    }

    async fn save_blue_green(&self, records: &HashMap<String, BlueGreenRecord>) -> MonoopsResult<()> {
        let dir = self.settings.deployments_dir();
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(BLUE_GREEN_FILENAME), serde_json::to_vec_pretty(records)?).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The `HEAD` commit of a git checkout, if `path` is one.
async fn git_commit(path: &Path) -> Option<String> {
    match utils::run_shell("git rev-parse HEAD", path, &HashMap::new(), GIT_TIMEOUT).await {
        Ok(output) if output.success() => {
            Some(output.stdout.trim().to_string()).filter(|c| !c.is_empty())
        }
        _ => None,
    }
}

/// Files in `workspace` matching any of `patterns`, relative to the workspace.
fn collect_artifacts(workspace: &Path, patterns: &[String]) -> Vec<String> {
    let mut artifacts = Vec::new();
    for pattern in patterns {
        let full = workspace.join(pattern);
        let Ok(paths) = glob::glob(&full.to_string_lossy()) else {
            tracing::warn!(pattern, "invalid artifact pattern");
            continue;
        };
        for path in paths.flatten().filter(|p| p.is_file()) {
            if let Ok(relative) = path.strip_prefix(workspace) {
                artifacts.push(relative.to_string_lossy().to_string());
            }
        }
    }
    artifacts.sort();
    artifacts.dedup();
    artifacts
}

/// Reads every `<project>/<id>.json` result under `root`.
async fn load_persisted(root: &Path) -> MonoopsResult<Vec<DeploymentResult>> {
    let mut results = Vec::new();
    if !fs::try_exists(root).await? {
        return Ok(results);
    }

    let mut projects = fs::read_dir(root).await?;
    while let Some(project) = projects.next_entry().await? {
        if !project.file_type().await?.is_dir() {
            continue;
        }
        let mut entries = fs::read_dir(project.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match serde_json::from_slice::<DeploymentResult>(&fs::read(&path).await?) {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable deployment record")
                    }
                }
            }
        }
    }
    Ok(results)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        deployment::Instance,
        registry::{LocalRegistry, MemoryAuditStore},
    };

    struct Fixture {
        _home: TempDir,
        projects: TempDir,
        assistant: DeploymentAssistant,
    }

    fn fixture(max_concurrent: usize) -> anyhow::Result<Fixture> {
        let home = tempfile::tempdir()?;
        let projects = tempfile::tempdir()?;
        std::fs::create_dir(projects.path().join("shop"))?;
        std::fs::write(projects.path().join("shop/index.html"), "v1")?;

        let settings = Settings::builder()
            .home_dir(home.path())
            .max_concurrent_deployments(max_concurrent)
            .build();
        let registry: Arc<dyn ProjectRegistry> = Arc::new(LocalRegistry::with_root(projects.path()));
        let audit: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let environments = Arc::new(EnvironmentManager::new(registry.clone(), audit.clone()));

        Ok(Fixture {
            assistant: DeploymentAssistant::new(settings, registry, environments, audit),
            _home: home,
            projects,
        })
    }

    fn config(health: &str) -> DeploymentConfig {
        DeploymentConfig {
            build_command: Some("mkdir -p dist && cp index.html dist/".into()),
            test_command: Some("test -f dist/index.html".into()),
            deploy_command: Some("echo deployed".into()),
            health_checks: vec![HealthCheck::Command {
                command: health.into(),
                timeout_secs: None,
            }],
            artifacts: vec!["dist/*".into()],
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_deploy_runs_stages_in_isolated_workspace() -> anyhow::Result<()> {
        let f = fixture(3)?;
        std::fs::create_dir_all(f.projects.path().join("shop/node_modules/x"))?;

        let result = f
            .assistant
            .deploy("shop", "local", None, Some(config("grep -q MONOOPS_DEPLOYMENT_ID .env")))
            .await?;

        assert_eq!(result.status, DeploymentStatus::Success, "{:#?}", result.logs);
        assert_eq!(result.health_status, HealthStatus::Healthy);
        assert_eq!(result.artifacts, vec!["dist/index.html".to_string()]);
        assert!(result.workspace.join("dist/index.html").exists());
        assert!(!result.workspace.join("node_modules").exists());
        assert!(!f.projects.path().join("shop/dist").exists());
        assert!(result.logs.iter().any(|l| l.contains("deployed")));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_stage_stops_pipeline() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let config = DeploymentConfig {
            build_command: Some("exit 4".into()),
            deploy_command: Some("touch deployed".into()),
            auto_rollback_on_failure: false,
            ..Default::default()
        };

        let result = f.assistant.deploy("shop", "local", None, Some(config)).await?;

        assert_eq!(result.status, DeploymentStatus::Failed);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("exited with 4")));
        assert!(!result.workspace.join("deployed").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unhealthy_deploy_rolls_back_to_previous_success() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let healthy_marker = f.projects.path().join("shop/healthy");
        std::fs::write(&healthy_marker, "")?;

        let good = f
            .assistant
            .deploy("shop", "local", None, Some(config("test -f healthy")))
            .await?;
        assert_eq!(good.status, DeploymentStatus::Success);

        std::fs::remove_file(&healthy_marker)?;
        let bad = f
            .assistant
            .deploy("shop", "local", None, Some(config("test -f healthy")))
            .await?;

        assert_eq!(bad.status, DeploymentStatus::RolledBack, "{:#?}", bad.logs);
        let rollback_id = bad.rollback_deployment_id.clone().expect("rollback id");
        let rollback = f.assistant.get_deployment_status(&rollback_id).await?;
        assert_eq!(rollback.status, DeploymentStatus::Success);
        assert_eq!(rollback.source_deployment_id.as_deref(), Some(good.id.as_str()));
        assert_eq!(rollback.rollback_of.as_deref(), Some(bad.id.as_str()));
        assert_eq!(rollback.commit_hash, good.commit_hash);

        let listed = f.assistant.list_deployments(Some("shop"), 10).await?;
        assert_eq!(listed.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_without_prior_success() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let result = f
            .assistant
            .deploy("shop", "local", None, Some(config("false")))
            .await?;
        assert_eq!(result.status, DeploymentStatus::Failed);
        assert!(result.logs.iter().any(|l| l.contains("auto-rollback failed")));

        let err = f.assistant.rollback(&result.id).await.unwrap_err();
        assert!(matches!(err, MonoopsError::NoPriorDeployment(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_history_survives_restart() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let result = f
            .assistant
            .deploy("shop", "local", None, Some(DeploymentConfig::default()))
            .await?;
        assert_eq!(result.health_status, HealthStatus::Unknown);

        let reopened = DeploymentAssistant::new(
            f.assistant.settings.clone(),
            f.assistant.registry.clone(),
            f.assistant.environments.clone(),
            Arc::new(MemoryAuditStore::new()),
        );
        assert_eq!(reopened.get_deployment_status(&result.id).await?.status, DeploymentStatus::Success);
        assert!(matches!(
            reopened.get_deployment_status("missing").await,
            Err(MonoopsError::DeploymentNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_blue_green_switches_only_when_healthy() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let marker = f.projects.path().join("shop/healthy");
        std::fs::write(&marker, "")?;

        let first = f
            .assistant
            .deploy_blue_green("shop", Some("production"), Some(config("test -f healthy")))
            .await?;
        assert!(first.switched);
        assert_eq!(first.record.active, Some(Instance::Blue));

        std::fs::remove_file(&marker)?;
        let second = f
            .assistant
            .deploy_blue_green("shop", Some("production"), Some(config("test -f healthy")))
            .await?;
        assert!(!second.switched);
        assert_eq!(second.instance, Instance::Green);
        assert_eq!(second.record.active, Some(Instance::Blue));
        assert_eq!(second.deployment.status, DeploymentStatus::Failed);

        let stored = f.assistant.get_blue_green("shop", "production").await?.expect("record");
        assert_eq!(stored.green_deployment_id.as_deref(), Some(second.deployment.id.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_rejects_past_concurrency_limit() -> anyhow::Result<()> {
        let f = fixture(0)?;
        let err = f
            .assistant
            .deploy("shop", "local", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonoopsError::TooManyConcurrentOperations { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_health_checks_uses_project_config() -> anyhow::Result<()> {
        let f = fixture(3)?;
        let config_dir = f.projects.path().join("shop/.monoops");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::write(
            config_dir.join(DEPLOY_CONFIG_FILENAME),
            "health_checks:\n  - type: command\n    command: test -f index.html\n",
        )?;

        let report = f.assistant.run_health_checks("shop", None).await?;
        assert_eq!(report.status, HealthStatus::Healthy);

        let err = f.assistant.run_health_checks("ghost", None).await.unwrap_err();
        assert!(matches!(err, MonoopsError::ProjectNotFound(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_run_health_checks_against_live_endpoint() -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let f = fixture(3)?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/ready", listener.local_addr()?);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            }
        });

        let check = |expected_status| HealthCheck::Http {
            url: url.clone(),
            expected_status,
            timeout_secs: Some(5),
        };

        let report = f.assistant.run_health_checks("shop", Some(vec![check(200)])).await?;
        assert_eq!(report.status, HealthStatus::Healthy);

        let report = f.assistant.run_health_checks("shop", Some(vec![check(201)])).await?;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.results[0].message, "status 200, expected 201");
        Ok(())
    }
}
