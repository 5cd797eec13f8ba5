use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use monoops::{
    cli::AnsiStyles,
    config::Settings,
    environment::EnvironmentType,
    launcher::StartupConfig,
    management::Monoops,
    registry::{JsonlAuditStore, LocalRegistry},
    resources::{Priority, ResourceRequirements},
    MonoopsResult,
};
use serde::Serialize;
use tokio::time;
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often a foreground `start` checks that the project is still up.
const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Loads settings and wires the components. `--projects-root` overrides the settings file.
pub async fn connect(projects_root: Option<PathBuf>) -> MonoopsResult<Monoops> {
    let settings = Settings::load_default().await?;
    match projects_root {
        Some(root) => {
            let audit = Arc::new(JsonlAuditStore::new(settings.audit_dir()));
            Ok(Monoops::new(
                settings,
                Arc::new(LocalRegistry::with_root(root)),
                audit,
            ))
        }
        None => Ok(Monoops::from_settings(settings, std::env::current_dir()?)),
    }
}

pub async fn start_subcommand(
    monoops: &Monoops,
    project: String,
    env: Option<String>,
    command: Option<String>,
    ports: Vec<u16>,
) -> MonoopsResult<()> {
    let custom = (command.is_some() || !ports.is_empty()).then(|| StartupConfig {
        command,
        ports,
        ..Default::default()
    });

    let launcher = monoops.get_launcher();
    launcher.recover().await?;
    let info = launcher.start(&project, env.as_deref(), custom).await?;
    println!(
        "{} {} (pid {}, ports {:?})",
        "started".valid(),
        project.literal(),
        info.pid,
        info.ports
    );
    println!("logs: {}", info.log_path.display());

    supervise_foreground(monoops, &project).await
}

pub async fn stop_subcommand(monoops: &Monoops, project: String, force: bool) -> MonoopsResult<()> {
    let launcher = monoops.get_launcher();
    launcher.recover().await?;
    let outcome = launcher.stop(&project, !force).await?;
    if outcome.success {
        println!("{} {}", "stopped".valid(), outcome.message);
    } else {
        println!("{} {}", "failed".error(), outcome.message);
    }
    Ok(())
}

pub async fn restart_subcommand(
    monoops: &Monoops,
    project: String,
    env: Option<String>,
) -> MonoopsResult<()> {
    let launcher = monoops.get_launcher();
    launcher.recover().await?;
    let info = launcher.restart(&project, env.as_deref(), None).await?;
    println!(
        "{} {} (pid {}, ports {:?})",
        "restarted".valid(),
        project.literal(),
        info.pid,
        info.ports
    );

    supervise_foreground(monoops, &project).await
}

pub async fn status_subcommand(monoops: &Monoops, project: Option<String>) -> MonoopsResult<()> {
    let launcher = monoops.get_launcher();
    launcher.recover().await?;
    match project {
        Some(project) => print_json(&launcher.get_status(&project).await?),
        None => print_json(&launcher.list().await),
    }
}

pub async fn logs_subcommand(
    monoops: &Monoops,
    project: String,
    lines: usize,
    env: Option<String>,
) -> MonoopsResult<()> {
    for line in monoops
        .get_launcher()
        .get_logs(&project, lines, env.as_deref())
        .await?
    {
        println!("{}", line);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn allocate_subcommand(
    monoops: &Monoops,
    project: String,
    min_cpu: f64,
    max_cpu: f64,
    min_memory: u64,
    max_memory: u64,
    priority: Priority,
    auto_scale: bool,
) -> MonoopsResult<()> {
    monoops.get_launcher().recover().await?;

    let requirements = ResourceRequirements {
        min_cpu_percent: min_cpu,
        max_cpu_percent: max_cpu,
        min_memory_mb: min_memory,
        max_memory_mb: max_memory,
        priority,
        auto_scale,
        ..Default::default()
    };
    let allocation = monoops
        .get_allocator()
        .allocate_resources(&project, requirements)
        .await?;

    if !allocation.enforced {
        eprintln!(
            "{} limits recorded but not enforced: {}",
            "warning:".error(),
            allocation.message.as_deref().unwrap_or("no enforcer available")
        );
    }
    print_json(&allocation)
}

pub async fn usage_subcommand(monoops: &Monoops, project: String) -> MonoopsResult<()> {
    monoops.get_launcher().recover().await?;
    print_json(&monoops.get_allocator().monitor_usage(&project).await?)
}

pub async fn predict_subcommand(monoops: &Monoops, project: String, hours: f64) -> MonoopsResult<()> {
    print_json(&monoops.get_allocator().predict_usage(&project, hours).await?)
}

pub async fn optimize_subcommand(monoops: &Monoops, projects: Vec<String>) -> MonoopsResult<()> {
    print_json(&monoops.get_allocator().optimize_allocation(&projects).await)
}

pub async fn deploy_subcommand(
    monoops: &Monoops,
    project: String,
    target: String,
    env: Option<String>,
    blue_green: bool,
) -> MonoopsResult<()> {
    let deployments = monoops.get_deployments();
    if blue_green {
        let outcome = deployments
            .deploy_blue_green(&project, env.as_deref(), None)
            .await?;
        if outcome.switched {
            println!("{} traffic on {}", "switched".valid(), outcome.instance);
        } else {
            println!("{} traffic unchanged", "not switched".error());
        }
        return print_json(&outcome);
    }

    let result = deployments
        .deploy(&project, &target, env.as_deref(), None)
        .await?;
    println!("{} {}", "deployment".header(), result.status);
    print_json(&result)
}

pub async fn backup_subcommand(
    monoops: &Monoops,
    project: String,
    incremental: bool,
    tags: Vec<String>,
) -> MonoopsResult<()> {
    let backup = monoops
        .get_backups()
        .backup_project(&project, incremental, tags)
        .await?;
    println!(
        "{} {} {} ({} files)",
        "backup".header(),
        backup.id.literal(),
        backup.status,
        backup.file_count
    );
    print_json(&backup)
}

pub async fn restore_subcommand(
    monoops: &Monoops,
    backup_id: String,
    target: PathBuf,
    paths: Vec<String>,
) -> MonoopsResult<()> {
    let selective = (!paths.is_empty()).then_some(paths);
    let outcome = monoops
        .get_backups()
        .restore_project(&backup_id, &target, selective)
        .await?;
    println!(
        "{} {} files into {}",
        "restored".valid(),
        outcome.files_restored,
        outcome.target.display()
    );
    print_json(&outcome)
}

pub async fn verify_subcommand(monoops: &Monoops, backup_id: String) -> MonoopsResult<()> {
    let report = monoops.get_backups().verify_backup(&backup_id).await?;
    if report.valid {
        println!("{} {}", "valid".valid(), backup_id);
    } else {
        println!("{} {}", "invalid".error(), backup_id);
        for error in &report.errors {
            println!("  - {}", error);
        }
    }
    Ok(())
}

pub async fn schedule_subcommand(
    monoops: &Monoops,
    project: Option<String>,
    cron: Option<String>,
    incremental: bool,
    tags: Vec<String>,
    list: bool,
    remove: Option<String>,
) -> MonoopsResult<()> {
    let backups = monoops.get_backups();
    if list {
        return print_json(&backups.list_schedules().await?);
    }

    if let Some(job_id) = remove {
        match backups.unschedule_backup(&job_id).await? {
            Some(job) => println!("{} {} ({})", "removed".valid(), job.id, job.cron),
            None => println!("{} no schedule {}", "missing".error(), job_id),
        }
        return Ok(());
    }

    // clap requires both when neither --list nor --remove is given.
    let (Some(project), Some(cron)) = (project, cron) else {
        return Ok(());
    };
    let job = backups
        .schedule_backup(&project, &cron, incremental, tags)
        .await?;
    println!(
        "{} {} next run {:?}",
        "scheduled".valid(),
        job.id.literal(),
        job.next_run
    );
    println!("run `monoops daemon` to execute schedules");
    Ok(())
}

pub async fn env_set_subcommand(
    monoops: &Monoops,
    project: String,
    name: String,
    variables: Vec<(String, String)>,
) -> MonoopsResult<()> {
    let variables: HashMap<String, String> = variables.into_iter().collect();
    let env = monoops
        .get_environments()
        .set_variables(&project, &name, &variables)
        .await?;
    println!(
        "{} {} variable(s) on {}",
        "set".valid(),
        variables.len(),
        env.get_name().literal()
    );
    Ok(())
}

pub async fn env_list_subcommand(monoops: &Monoops, project: String) -> MonoopsResult<()> {
    for env in monoops.get_environments().list_environments(&project).await? {
        let marker = if *env.get_active() { "*" } else { " " };
        println!(
            "{} {} ({}, {} variables)",
            marker,
            env.get_name().literal(),
            env.get_env_type(),
            env.get_variables().len()
        );
    }
    Ok(())
}

pub async fn env_template_subcommand(
    monoops: &Monoops,
    project: String,
    name: String,
    env_type: Option<EnvironmentType>,
) -> MonoopsResult<()> {
    let env_type = env_type.unwrap_or_else(|| EnvironmentType::from_name(&name));
    let env = monoops
        .get_environments()
        .create_environment_template(&project, &name, env_type)
        .await?;
    println!(
        "{} {} ({}) with {} variables",
        "created".valid(),
        env.get_name().literal(),
        env.get_env_type(),
        env.get_variables().len()
    );
    Ok(())
}

/// Re-adopts running projects, runs the backup scheduler and waits for ctrl-c.
pub async fn daemon_subcommand(monoops: &Monoops) -> MonoopsResult<()> {
    let adopted = monoops.get_launcher().recover().await?;
    tracing::info!(?adopted, "daemon started");
    println!("{} adopted {} project(s); ctrl-c to exit", "daemon".header(), adopted.len());

    let token = CancellationToken::new();
    let scheduler = monoops.get_backups().start_scheduler(token.clone());

    tokio::signal::ctrl_c().await?;
    token.cancel();
    scheduler.await?;

    monoops.get_launcher().shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Prints a value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> MonoopsResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Keeps the process alive while the project runs, stopping it on ctrl-c.
async fn supervise_foreground(monoops: &Monoops, project: &str) -> MonoopsResult<()> {
    let launcher = monoops.get_launcher();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                let outcome = launcher.stop(project, true).await?;
                println!("{} {}", "stopped".valid(), outcome.message);
                return Ok(());
            }
            _ = time::sleep(FOREGROUND_POLL_INTERVAL) => {
                let status = launcher.get_status(project).await?;
                if !status.get_status().is_active() {
                    println!("{} {:?}", "exited".error(), status.get_status());
                    return Ok(());
                }
            }
        }
    }
}
