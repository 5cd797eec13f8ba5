use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use regex::Regex;
use serde::Serialize;
use tokio::{fs, sync::Mutex};

use crate::{
    registry::{self, record_audit, AuditKind, AuditStore, ProjectRegistry},
    utils::{
        self, BACKUP_FILE_SUFFIX, ENVIRONMENTS_SUBDIR, PRIMARY_ENV_FILENAME, PROJECT_CONFIG_DIR,
    },
    MonoopsError, MonoopsResult,
};

use super::{EnvVariable, Environment, EnvironmentDefinition, EnvironmentType};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Suffixes of `.env.*` files that are never environments.
const IGNORED_ENV_FILE_SUFFIXES: &[&str] = &[BACKUP_FILE_SUFFIX, "example", "sample", "template"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owns every project's environments and enforces that at most one is active per project.
pub struct EnvironmentManager {
    registry: Arc<dyn ProjectRegistry>,
    audit: Arc<dyn AuditStore>,

    /// Loaded environments keyed by project id, then by environment name.
    projects: Mutex<HashMap<String, BTreeMap<String, Environment>>>,
}

/// The outcome of a `switch_environment` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchOutcome {
    /// Whether the switch happened.
    pub success: bool,

    /// The now-active environment.
    pub environment: String,

    /// The environment that was active before, if any.
    pub previous: Option<String>,

    /// Where the previous variable file was backed up, if it existed.
    pub env_file_backup: Option<PathBuf>,

    /// Config files that were written.
    pub config_files_written: Vec<String>,

    /// Secret variables that could not be materialized because their plaintext is unknown.
    pub unresolved_secrets: Vec<String>,

    /// Human-readable summary.
    pub message: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvironmentManager {
    /// Creates a manager resolving projects through `registry`.
    pub fn new(registry: Arc<dyn ProjectRegistry>, audit: Arc<dyn AuditStore>) -> Self {
        Self {
            registry,
            audit,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Lists a project's environments ordered by name.
    pub async fn list_environments(&self, project_id: &str) -> MonoopsResult<Vec<Environment>> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;
        Ok(envs.values().cloned().collect())
    }

    /// Returns one environment.
    pub async fn get_environment(
        &self,
        project_id: &str,
        name: &str,
    ) -> MonoopsResult<Environment> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;
        envs.get(name)
            .cloned()
            .ok_or_else(|| MonoopsError::EnvironmentNotFound {
                project_id: project_id.to_string(),
                environment: name.to_string(),
            })
    }

    /// Returns the active environment, if one is set.
    pub async fn get_active_environment(
        &self,
        project_id: &str,
    ) -> MonoopsResult<Option<Environment>> {
        Ok(self
            .list_environments(project_id)
            .await?
            .into_iter()
            .find(|e| *e.get_active()))
    }

    /// Returns the plaintext variables of `name`, or an empty map if the environment is unknown.
    ///
    /// Used by the launcher and deployment pipeline, which treat a missing environment as "no
    /// extra variables" rather than an error.
    pub async fn materialize_variables(
        &self,
        project_id: &str,
        name: &str,
    ) -> MonoopsResult<BTreeMap<String, String>> {
        match self.get_environment(project_id, name).await {
            Ok(env) => Ok(env.plaintext_variables()),
            Err(MonoopsError::EnvironmentNotFound { .. }) => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Makes `name` the only active environment and writes its variables and config files.
    pub async fn switch_environment(
        &self,
        project_id: &str,
        name: &str,
    ) -> MonoopsResult<SwitchOutcome> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;

        if !envs.contains_key(name) {
            return Err(MonoopsError::EnvironmentNotFound {
                project_id: project_id.to_string(),
                environment: name.to_string(),
            });
        }

        let previous = envs
            .values()
            .find(|e| *e.get_active())
            .map(|e| e.get_name().clone());

        for (env_name, env) in envs.iter_mut() {
            env.set_active(env_name == name);
        }

        let target = envs
            .get(name)
            .cloned()
            .ok_or_else(|| MonoopsError::custom(anyhow::anyhow!("environment vanished")))?;

        let env_file_backup = utils::write_with_backup(
            project_path.join(PRIMARY_ENV_FILENAME),
            render_env_file(&target.plaintext_variables()),
            BACKUP_FILE_SUFFIX,
        )
        .await?;

        let mut config_files_written = Vec::new();
        for (relative, contents) in target.get_config_files() {
            let path = safe_join(&project_path, relative)?;
            utils::write_with_backup(&path, contents, BACKUP_FILE_SUFFIX).await?;
            config_files_written.push(relative.clone());
        }

        for env in envs.values() {
            persist_definition(&project_path, env).await?;
        }

        let unresolved_secrets = target.unresolved_secrets();
        if !unresolved_secrets.is_empty() {
            tracing::warn!(
                project_id,
                environment = name,
                secrets = ?unresolved_secrets,
                "switched environment with unresolved secrets"
            );
        }

        tracing::info!(project_id, environment = name, previous = ?previous, "switched environment");
        record_audit(&self.audit, AuditKind::Environment, project_id, &target);

        Ok(SwitchOutcome {
            success: true,
            environment: name.to_string(),
            message: match &previous {
                Some(prev) if prev != name => format!("switched from {} to {}", prev, name),
                Some(_) => format!("re-applied {}", name),
                None => format!("activated {}", name),
            },
            previous,
            env_file_backup,
            config_files_written,
            unresolved_secrets,
        })
    }

    /// Sets variables on an environment, creating it on first write.
    ///
    /// Every value is validated against the variable's pattern before anything is changed.
    pub async fn set_variables(
        &self,
        project_id: &str,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> MonoopsResult<Environment> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;

        let env = envs
            .entry(name.to_string())
            .or_insert_with(|| Environment::new(name, EnvironmentType::from_name(name)));

        for (key, value) in variables {
            validate_key(key)?;
            if let Some(pattern) = env
                .get_variables()
                .get(key)
                .and_then(|v| v.validation.as_deref())
            {
                validate_value(key, value, pattern)?;
            }
        }

        for (key, value) in variables {
            let validation = env
                .get_variables()
                .get(key)
                .and_then(|v| v.validation.clone());
            let mut variable = EnvVariable::new(key, value.clone());
            variable.validation = validation;
            env.set_variable(key.clone(), variable);
        }

        let env = env.clone();
        persist_definition(&project_path, &env).await?;
        write_variable_file(&project_path, &env).await?;

        if *env.get_active() {
            utils::write_with_backup(
                project_path.join(PRIMARY_ENV_FILENAME),
                render_env_file(&env.plaintext_variables()),
                BACKUP_FILE_SUFFIX,
            )
            .await?;
        }

        tracing::info!(
            project_id,
            environment = name,
            count = variables.len(),
            "set environment variables"
        );
        record_audit(&self.audit, AuditKind::Environment, project_id, &env);

        Ok(env)
    }

    /// Creates an environment pre-populated with conventional defaults for its type.
    pub async fn create_environment_template(
        &self,
        project_id: &str,
        name: &str,
        env_type: EnvironmentType,
    ) -> MonoopsResult<Environment> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;

        if envs.contains_key(name) {
            return Err(MonoopsError::Validation(format!(
                "environment '{}' already exists for project {}",
                name, project_id
            )));
        }

        let env = template(name, env_type);
        persist_definition(&project_path, &env).await?;
        write_variable_file(&project_path, &env).await?;
        envs.insert(name.to_string(), env.clone());

        tracing::info!(project_id, environment = name, %env_type, "created environment template");
        Ok(env)
    }

    /// Deletes an inactive environment and its files.
    pub async fn delete_environment(&self, project_id: &str, name: &str) -> MonoopsResult<()> {
        let project_path = self.project_path(project_id).await?;
        let mut projects = self.projects.lock().await;
        let envs = Self::loaded(&mut projects, project_id, &project_path).await?;

        let env = envs
            .get(name)
            .ok_or_else(|| MonoopsError::EnvironmentNotFound {
                project_id: project_id.to_string(),
                environment: name.to_string(),
            })?;

        if *env.get_active() {
            return Err(MonoopsError::Validation(format!(
                "cannot delete active environment '{}'",
                name
            )));
        }

        envs.remove(name);
        for path in [
            definition_path(&project_path, name),
            variable_file_path(&project_path, name),
        ] {
            if fs::try_exists(&path).await? {
                fs::remove_file(&path).await?;
            }
        }

        Ok(())
    }

    /// Drops cached state for a project so the next call reloads from disk.
    pub async fn invalidate(&self, project_id: &str) {
        self.projects.lock().await.remove(project_id);
    }

    async fn project_path(&self, project_id: &str) -> MonoopsResult<PathBuf> {
        Ok(registry::resolve_project(self.registry.as_ref(), project_id)
            .await?
            .path)
    }

    async fn loaded<'a>(
        projects: &'a mut HashMap<String, BTreeMap<String, Environment>>,
        project_id: &str,
        project_path: &Path,
    ) -> MonoopsResult<&'a mut BTreeMap<String, Environment>> {
        if !projects.contains_key(project_id) {
            let envs = load_environments(project_path).await?;
            projects.insert(project_id.to_string(), envs);
        }

        projects
            .get_mut(project_id)
            .ok_or_else(|| MonoopsError::custom(anyhow::anyhow!("environment cache miss")))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Loads a project's environments from definition files and legacy variable files.
///
/// A bare `.env` is imported as an active `development` environment only when nothing else
/// defines environments. If the files disagree and several are marked active, the first by name
/// wins.
pub async fn load_environments(
    project_path: &Path,
) -> MonoopsResult<BTreeMap<String, Environment>> {
    let mut envs = BTreeMap::new();

    let definitions_dir = environments_dir(project_path);
    if fs::try_exists(&definitions_dir).await? {
        let mut dir = fs::read_dir(&definitions_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
                let contents = fs::read_to_string(&path).await?;
                match serde_yaml::from_str::<EnvironmentDefinition>(&contents) {
                    Ok(definition) => {
                        let env = Environment::from_definition(definition);
                        envs.insert(env.get_name().clone(), env);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed environment file");
                    }
                }
            }
        }
    }

    let mut dir = fs::read_dir(project_path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(env_name) = file_name.strip_prefix(".env.") else {
            continue;
        };
        if !is_environment_file_name(env_name) {
            continue;
        }

        let env = envs
            .entry(env_name.to_string())
            .or_insert_with(|| Environment::new(env_name, EnvironmentType::from_name(env_name)));
        for (key, value) in parse_env_file(&entry.path())? {
            env.merge_plaintext(&key, &value);
        }
    }

    let primary = project_path.join(PRIMARY_ENV_FILENAME);
    if envs.is_empty() && fs::try_exists(&primary).await? {
        let mut env = Environment::new("development", EnvironmentType::Development);
        for (key, value) in parse_env_file(&primary)? {
            env.set_variable(key.clone(), EnvVariable::new(&key, value));
        }
        env.set_active(true);
        tracing::info!(project = %project_path.display(), "imported legacy .env as development");
        envs.insert("development".to_string(), env);
    }

    let mut seen_active = false;
    for env in envs.values_mut() {
        if *env.get_active() {
            if seen_active {
                tracing::warn!(environment = %env.get_name(), "multiple active environments, deactivating");
                env.set_active(false);
            }
            seen_active = true;
        }
    }

    Ok(envs)
}

/// Renders variables as a flat `KEY=value` file, quoting values that need it.
pub fn render_env_file(variables: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in variables {
        let needs_quotes = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '$' | '\\'));
        if needs_quotes {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$")
                .replace('\n', "\\n");
            out.push_str(&format!("{}=\"{}\"\n", key, escaped));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

/// Parses a flat variable file with `dotenvy`.
pub fn parse_env_file(path: &Path) -> MonoopsResult<Vec<(String, String)>> {
    let iter = dotenvy::from_path_iter(path).map_err(MonoopsError::custom)?;
    let mut pairs = Vec::new();
    for item in iter {
        match item {
            Ok(pair) => pairs.push(pair),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed variable line");
            }
        }
    }
    Ok(pairs)
}

fn environments_dir(project_path: &Path) -> PathBuf {
    project_path
        .join(PROJECT_CONFIG_DIR)
        .join(ENVIRONMENTS_SUBDIR)
}

fn definition_path(project_path: &Path, name: &str) -> PathBuf {
    environments_dir(project_path).join(format!("{}.yaml", name))
}

fn variable_file_path(project_path: &Path, name: &str) -> PathBuf {
    project_path.join(format!("{}.{}", PRIMARY_ENV_FILENAME, name))
}

async fn persist_definition(project_path: &Path, env: &Environment) -> MonoopsResult<()> {
    let path = definition_path(project_path, env.get_name());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, serde_yaml::to_string(&env.to_definition())?).await?;
    Ok(())
}

async fn write_variable_file(project_path: &Path, env: &Environment) -> MonoopsResult<()> {
    fs::write(
        variable_file_path(project_path, env.get_name()),
        render_env_file(&env.plaintext_variables()),
    )
    .await?;
    Ok(())
}

fn validate_key(key: &str) -> MonoopsResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(MonoopsError::Validation(format!(
            "invalid variable name: {}",
            key
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str, pattern: &str) -> MonoopsResult<()> {
    let regex = Regex::new(pattern).map_err(|e| {
        MonoopsError::Validation(format!("invalid validation pattern for {}: {}", key, e))
    })?;
    if !regex.is_match(value) {
        return Err(MonoopsError::Validation(format!(
            "value for {} does not match {}",
            key, pattern
        )));
    }
    Ok(())
}

/// Joins a relative config-file path onto the project, rejecting absolute paths and `..`.
fn safe_join(project_path: &Path, relative: &str) -> MonoopsResult<PathBuf> {
    let relative_path = Path::new(relative);
    let escapes = relative_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(MonoopsError::Validation(format!(
            "config file path escapes project: {}",
            relative
        )));
    }
    Ok(project_path.join(relative_path))
}

fn template(name: &str, env_type: EnvironmentType) -> Environment {
    let (debug, log_level, node_env) = match env_type {
        EnvironmentType::Development => ("true", "debug", "development"),
        EnvironmentType::Staging => ("false", "info", "production"),
        EnvironmentType::Production => ("false", "warn", "production"),
        EnvironmentType::Test => ("false", "error", "test"),
        EnvironmentType::Custom => ("false", "info", "development"),
    };

    let mut env = Environment::new(name, env_type);
    for (key, value) in [
        ("APP_ENV", env_type.to_string()),
        ("NODE_ENV", node_env.to_string()),
        ("DEBUG", debug.to_string()),
        ("LOG_LEVEL", log_level.to_string()),
    ] {
        env.set_variable(key, EnvVariable::with_secret(value, false));
    }

    let mut port = EnvVariable::with_secret("3000", false);
    port.validation = Some(r"^\d{1,5}$".to_string());
    env.set_variable("PORT", port);

    env
}

/// Whether the part of a `.env.<name>` file name after `.env.` names an environment.
///
/// Backups of any env file (`.env.local.bak`) and sample files are skipped.
fn is_environment_file_name(env_name: &str) -> bool {
    if env_name.is_empty() {
        return false;
    }
    let last = env_name.rsplit('.').next().unwrap_or(env_name);
    !IGNORED_ENV_FILE_SUFFIXES.contains(&last)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LocalRegistry, MemoryAuditStore};

    async fn manager_with_project() -> anyhow::Result<(tempfile::TempDir, EnvironmentManager)> {
        let root = tempfile::tempdir()?;
        std::fs::create_dir(root.path().join("web"))?;
        let registry = Arc::new(LocalRegistry::with_root(root.path()));
        let manager = EnvironmentManager::new(registry, Arc::new(MemoryAuditStore::new()));
        Ok((root, manager))
    }

    #[tokio::test]
    async fn test_set_variables_creates_environment_and_hashes_secrets() -> anyhow::Result<()> {
        let (root, manager) = manager_with_project().await?;
        let vars = HashMap::from([
            ("DB_PASSWORD".to_string(), "hunter2".to_string()),
            ("PORT".to_string(), "8080".to_string()),
        ]);

        let env = manager.set_variables("web", "staging", &vars).await?;

        assert_eq!(*env.get_env_type(), EnvironmentType::Staging);
        assert!(env.get_variables()["DB_PASSWORD"].secret);
        let definition = std::fs::read_to_string(
            root.path().join("web/.monoops/environments/staging.yaml"),
        )?;
        assert!(!definition.contains("hunter2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_switch_environment_materializes_and_backs_up() -> anyhow::Result<()> {
        let (root, manager) = manager_with_project().await?;
        let project = root.path().join("web");
        std::fs::write(project.join(".env"), "OLD=1\n")?;

        manager
            .set_variables(
                "web",
                "production",
                &HashMap::from([("API_TOKEN".to_string(), "s3cr3t".to_string())]),
            )
            .await?;

        let outcome = manager.switch_environment("web", "production").await?;

        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(project.join(".env.bak"))?, "OLD=1\n");
        assert_eq!(
            std::fs::read_to_string(project.join(".env"))?,
            "API_TOKEN=s3cr3t\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_switch_environment_keeps_single_active() -> anyhow::Result<()> {
        let (_root, manager) = manager_with_project().await?;
        for name in ["development", "staging", "production"] {
            manager
                .create_environment_template("web", name, EnvironmentType::from_name(name))
                .await?;
        }

        for name in ["staging", "production", "development", "production"] {
            manager.switch_environment("web", name).await?;
            let active: Vec<_> = manager
                .list_environments("web")
                .await?
                .into_iter()
                .filter(|e| *e.get_active())
                .map(|e| e.get_name().clone())
                .collect();
            assert_eq!(active, vec![name.to_string()]);
        }

        manager.invalidate("web").await;
        let active = manager.get_active_environment("web").await?.unwrap();
        assert_eq!(active.get_name(), "production");
        Ok(())
    }

    #[tokio::test]
    async fn test_switch_to_unknown_environment_fails() -> anyhow::Result<()> {
        let (_root, manager) = manager_with_project().await?;
        let result = manager.switch_environment("web", "nope").await;
        assert!(matches!(result, Err(MonoopsError::EnvironmentNotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_env_imported_as_active_development() -> anyhow::Result<()> {
        let (root, manager) = manager_with_project().await?;
        std::fs::write(root.path().join("web/.env"), "PORT=4000\nNAME=\"my app\"\n")?;

        let active = manager.get_active_environment("web").await?.unwrap();

        assert_eq!(active.get_name(), "development");
        assert_eq!(
            active.plaintext_variables().get("NAME").map(String::as_str),
            Some("my app")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_and_sample_env_files_are_not_environments() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        std::fs::write(root.path().join(".env.local"), "PORT=4000\n")?;
        std::fs::write(root.path().join(".env.local.bak"), "PORT=3000\n")?;
        std::fs::write(root.path().join(".env.bak"), "PORT=2000\n")?;
        std::fs::write(root.path().join(".env.production.example"), "PORT=\n")?;
        std::fs::write(root.path().join(".env.template"), "PORT=\n")?;

        let envs = load_environments(root.path()).await?;

        assert_eq!(envs.keys().collect::<Vec<_>>(), vec!["local"]);
        assert_eq!(
            envs["local"].plaintext_variables().get("PORT").map(String::as_str),
            Some("4000")
        );
        Ok(())
    }

    #[test]
    fn test_environment_file_names() {
        assert!(is_environment_file_name("staging"));
        assert!(is_environment_file_name("local"));
        assert!(!is_environment_file_name(""));
        assert!(!is_environment_file_name("bak"));
        assert!(!is_environment_file_name("local.bak"));
        assert!(!is_environment_file_name("staging.sample"));
    }

    #[tokio::test]
    async fn test_template_validation_rejects_bad_port() -> anyhow::Result<()> {
        let (_root, manager) = manager_with_project().await?;
        manager
            .create_environment_template("web", "production", EnvironmentType::Production)
            .await?;

        let result = manager
            .set_variables(
                "web",
                "production",
                &HashMap::from([("PORT".to_string(), "eighty".to_string())]),
            )
            .await;

        assert!(matches!(result, Err(MonoopsError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_config_files_cannot_escape_project() {
        assert!(safe_join(Path::new("/p"), "../etc/passwd").is_err());
        assert!(safe_join(Path::new("/p"), "/etc/passwd").is_err());
        assert_eq!(
            safe_join(Path::new("/p"), "config/app.json").unwrap(),
            PathBuf::from("/p/config/app.json")
        );
    }

    #[test]
    fn test_render_env_file_quotes() {
        let vars = BTreeMap::from([
            ("A".to_string(), "plain".to_string()),
            ("B".to_string(), "with space".to_string()),
        ]);
        assert_eq!(render_env_file(&vars), "A=plain\nB=\"with space\"\n");
    }
}
