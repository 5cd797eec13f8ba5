use std::path::Path;

use tokio::fs;

use crate::{MonoopsError, MonoopsResult};

use super::{ProjectType, StartupConfig};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const PYTHON_MARKERS: &[&str] = &["requirements.txt", "pyproject.toml", "Pipfile", "setup.py"];

const PYTHON_ENTRY_POINTS: &[&str] = &["main.py", "app.py", "server.py", "run.py"];

const NODE_ENTRY_POINTS: &[&str] = &["index.js", "server.js", "app.js", "main.js"];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Detects the project type from marker files in `project_path`.
pub async fn detect_project_type(project_path: &Path) -> ProjectType {
    let has = |name: &str| project_path.join(name).exists();

    if has("package.json") {
        ProjectType::Node
    } else if PYTHON_MARKERS.iter().any(|m| has(*m)) {
        ProjectType::Python
    } else if has("go.mod") {
        ProjectType::Go
    } else if has("Cargo.toml") {
        ProjectType::Rust
    } else if has("index.html") {
        ProjectType::Static
    } else {
        ProjectType::Unknown
    }
}

/// Picks the project type: startup config first, then the registry's declaration, then markers.
pub async fn resolve_project_type(
    project_path: &Path,
    declared: Option<&str>,
    config: &StartupConfig,
) -> ProjectType {
    if let Some(project_type) = config.project_type {
        return project_type;
    }
    if config.command.is_some() {
        return ProjectType::Custom;
    }
    if let Some(project_type) = declared.and_then(|d| d.parse().ok()) {
        return project_type;
    }
    detect_project_type(project_path).await
}

/// Builds the argv used to run a project of the given type.
///
/// An explicit command in the config always wins and runs through `sh -c`.
pub async fn build_command(
    project_id: &str,
    project_type: ProjectType,
    project_path: &Path,
    port: u16,
    config: &StartupConfig,
) -> MonoopsResult<Vec<String>> {
    if let Some(command) = &config.command {
        return Ok(argv(["sh", "-c", command.as_str()]));
    }

    let no_entry_point = |detail: &str| MonoopsError::StartupFailed {
        project_id: project_id.to_string(),
        reason: format!("no runnable entry point: {}", detail),
    };

    match project_type {
        ProjectType::Node => {
            let manifest = fs::read_to_string(project_path.join("package.json")).await?;
            let manifest: serde_json::Value = serde_json::from_str(&manifest)?;
            let scripts = &manifest["scripts"];

            if scripts["start"].is_string() {
                return Ok(argv(["npm", "start"]));
            }
            if scripts["dev"].is_string() {
                return Ok(argv(["npm", "run", "dev"]));
            }
            if let Some(main) = manifest["main"].as_str() {
                if project_path.join(main).exists() {
                    return Ok(argv(["node", main]));
                }
            }
            NODE_ENTRY_POINTS
                .iter()
                .find(|f| project_path.join(f).exists())
                .map(|f| argv(["node", *f]))
                .ok_or_else(|| no_entry_point("package.json has no start script or main file"))
        }
        ProjectType::Python => {
            if project_path.join("manage.py").exists() {
                let bind = format!("0.0.0.0:{}", port);
                return Ok(argv(["python3", "manage.py", "runserver", bind.as_str()]));
            }
            PYTHON_ENTRY_POINTS
                .iter()
                .find(|f| project_path.join(f).exists())
                .map(|f| argv(["python3", *f]))
                .ok_or_else(|| no_entry_point("no main.py, app.py, server.py or manage.py"))
        }
        ProjectType::Go => Ok(argv(["go", "run", "."])),
        ProjectType::Rust => Ok(argv(["cargo", "run"])),
        ProjectType::Static => {
            let port = port.to_string();
            Ok(argv(["python3", "-m", "http.server", port.as_str()]))
        }
        ProjectType::Custom => Err(no_entry_point("custom project without a command")),
        ProjectType::Unknown => Err(no_entry_point("project type could not be detected")),
    }
}

fn argv<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts.into_iter().map(str::to_string).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_types_from_markers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(detect_project_type(dir.path()).await, ProjectType::Unknown);

        fs::write(dir.path().join("index.html"), "<html/>").await?;
        assert_eq!(detect_project_type(dir.path()).await, ProjectType::Static);

        fs::write(dir.path().join("requirements.txt"), "flask").await?;
        assert_eq!(detect_project_type(dir.path()).await, ProjectType::Python);

        fs::write(dir.path().join("package.json"), "{}").await?;
        assert_eq!(detect_project_type(dir.path()).await, ProjectType::Node);
        Ok(())
    }

    #[tokio::test]
    async fn test_node_command_prefers_start_script() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite", "start": "node server.js"}}"#,
        )
        .await?;

        let cmd = build_command("web", ProjectType::Node, dir.path(), 3000, &StartupConfig::default())
            .await?;
        assert_eq!(cmd, vec!["npm", "start"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_python_without_entry_point_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("requirements.txt"), "").await?;

        let err = build_command("api", ProjectType::Python, dir.path(), 3000, &StartupConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonoopsError::StartupFailed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_command_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = StartupConfig {
            command: Some("./run.sh --fast".into()),
            ..Default::default()
        };

        let project_type = resolve_project_type(dir.path(), Some("node"), &config).await;
        assert_eq!(project_type, ProjectType::Custom);

        let cmd = build_command("x", project_type, dir.path(), 3000, &config).await?;
        assert_eq!(cmd, vec!["sh", "-c", "./run.sh --fast"]);
        Ok(())
    }
}
