use std::{path::Path, process::Stdio, time::Duration};

use tokio::{fs, process::Command, time};

use crate::{MonoopsError, MonoopsResult};

use super::{DatabaseConfig, DatabaseKind};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Dumps a project's database into `out_dir`.
///
/// Returns the dump's file name. Server engines are dumped with their client tools, found on
/// `PATH`; sqlite databases are copied.
pub async fn dump_database(
    config: &DatabaseConfig,
    project_path: &Path,
    out_dir: &Path,
    timeout: Duration,
) -> MonoopsResult<String> {
    fs::create_dir_all(out_dir).await?;

    match config.kind {
        DatabaseKind::Postgres => {
            let name = required(config.name.as_deref(), "postgres database name")?;
            let file_name = format!("{}.sql", name);

            let mut command = Command::new(which::which("pg_dump").map_err(MonoopsError::custom)?);
            command
                .arg("--no-password")
                .arg("--file")
                .arg(out_dir.join(&file_name));
            if let Some(host) = &config.host {
                command.arg("--host").arg(host);
            }
            if let Some(port) = config.port {
                command.arg("--port").arg(port.to_string());
            }
            if let Some(user) = &config.user {
                command.arg("--username").arg(user);
            }
            if let Some(password) = password(config) {
                command.env("PGPASSWORD", password);
            }
            command.arg(name);

            run(command, "pg_dump", timeout).await?;
            Ok(file_name)
        }
        DatabaseKind::Mysql => {
            let name = required(config.name.as_deref(), "mysql database name")?;
            let file_name = format!("{}.sql", name);

            let mut command =
                Command::new(which::which("mysqldump").map_err(MonoopsError::custom)?);
            command.arg(format!(
                "--result-file={}",
                out_dir.join(&file_name).display()
            ));
            if let Some(host) = &config.host {
                command.arg(format!("--host={}", host));
            }
            if let Some(port) = config.port {
                command.arg(format!("--port={}", port));
            }
            if let Some(user) = &config.user {
                command.arg(format!("--user={}", user));
            }
            if let Some(password) = password(config) {
                command.env("MYSQL_PWD", password);
            }
            command.arg(name);

            run(command, "mysqldump", timeout).await?;
            Ok(file_name)
        }
        DatabaseKind::Sqlite => {
            let relative = required(config.path.as_deref(), "sqlite database path")?;
            let source = project_path.join(relative);
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    MonoopsError::Validation(format!("invalid sqlite path: {}", relative))
                })?;

            fs::copy(&source, out_dir.join(&file_name)).await?;
            tracing::debug!(source = %source.display(), "copied sqlite database");
            Ok(file_name)
        }
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> MonoopsResult<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MonoopsError::Validation(format!("missing {}", what)))
}

fn password(config: &DatabaseConfig) -> Option<String> {
    config
        .password_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
}

async fn run(mut command: Command, tool: &str, timeout: Duration) -> MonoopsResult<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn()?;
    let output = time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| MonoopsError::Timeout {
            operation: tool.to_string(),
            seconds: timeout.as_secs(),
        })??;

    if !output.status.success() {
        return Err(MonoopsError::ExecutionFailed(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
