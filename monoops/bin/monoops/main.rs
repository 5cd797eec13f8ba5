mod handlers;

use clap::{CommandFactory, Parser};
use monoops::{
    cli::{MonoopsArgs, MonoopsSubcommand},
    MonoopsResult,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MonoopsResult<()> {
    let args = MonoopsArgs::parse();

    // RUST_LOG wins over --verbose.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose {
            "monoops=debug"
        } else {
            "monoops=info"
        })
    });
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let Some(subcommand) = args.subcommand else {
        MonoopsArgs::command().print_help()?;
        return Ok(());
    };

    let monoops = handlers::connect(args.projects_root).await?;
    match subcommand {
        MonoopsSubcommand::Start {
            project,
            env,
            command,
            port,
        } => {
            handlers::start_subcommand(&monoops, project, env, command, port).await?;
        }
        MonoopsSubcommand::Stop { project, force } => {
            handlers::stop_subcommand(&monoops, project, force).await?;
        }
        MonoopsSubcommand::Restart { project, env } => {
            handlers::restart_subcommand(&monoops, project, env).await?;
        }
        MonoopsSubcommand::Status { project } => {
            handlers::status_subcommand(&monoops, project).await?;
        }
        MonoopsSubcommand::Logs {
            project,
            lines,
            env,
        } => {
            handlers::logs_subcommand(&monoops, project, lines, env).await?;
        }
        MonoopsSubcommand::Allocate {
            project,
            min_cpu,
            max_cpu,
            min_memory,
            max_memory,
            priority,
            auto_scale,
        } => {
            handlers::allocate_subcommand(
                &monoops, project, min_cpu, max_cpu, min_memory, max_memory, priority, auto_scale,
            )
            .await?;
        }
        MonoopsSubcommand::Usage { project } => {
            handlers::usage_subcommand(&monoops, project).await?;
        }
        MonoopsSubcommand::Predict { project, hours } => {
            handlers::predict_subcommand(&monoops, project, hours).await?;
        }
        MonoopsSubcommand::Optimize { projects } => {
            handlers::optimize_subcommand(&monoops, projects).await?;
        }
        MonoopsSubcommand::System => {
            handlers::print_json(&monoops.get_allocator().get_system_resources().await?)?;
        }
        MonoopsSubcommand::Deploy {
            project,
            target,
            env,
            blue_green,
        } => {
            handlers::deploy_subcommand(&monoops, project, target, env, blue_green).await?;
        }
        MonoopsSubcommand::Rollback { deployment_id } => {
            handlers::print_json(&monoops.get_deployments().rollback(&deployment_id).await?)?;
        }
        MonoopsSubcommand::Deployments { project, limit } => {
            handlers::print_json(
                &monoops
                    .get_deployments()
                    .list_deployments(project.as_deref(), limit)
                    .await?,
            )?;
        }
        MonoopsSubcommand::Backup {
            project,
            incremental,
            tags,
        } => {
            handlers::backup_subcommand(&monoops, project, incremental, tags).await?;
        }
        MonoopsSubcommand::Restore {
            backup_id,
            target,
            paths,
        } => {
            handlers::restore_subcommand(&monoops, backup_id, target, paths).await?;
        }
        MonoopsSubcommand::Verify { backup_id } => {
            handlers::verify_subcommand(&monoops, backup_id).await?;
        }
        MonoopsSubcommand::Backups { project } => {
            handlers::print_json(&monoops.get_backups().list_backups(project.as_deref()).await?)?;
        }
        MonoopsSubcommand::Schedule {
            project,
            cron,
            incremental,
            tags,
            list,
            remove,
        } => {
            handlers::schedule_subcommand(&monoops, project, cron, incremental, tags, list, remove)
                .await?;
        }
        MonoopsSubcommand::Cleanup { days } => {
            handlers::print_json(&monoops.get_backups().cleanup_old_backups(days).await?)?;
        }
        MonoopsSubcommand::EnvSwitch { project, name } => {
            handlers::print_json(
                &monoops
                    .get_environments()
                    .switch_environment(&project, &name)
                    .await?,
            )?;
        }
        MonoopsSubcommand::EnvSet {
            project,
            name,
            variables,
        } => {
            handlers::env_set_subcommand(&monoops, project, name, variables).await?;
        }
        MonoopsSubcommand::EnvList { project } => {
            handlers::env_list_subcommand(&monoops, project).await?;
        }
        MonoopsSubcommand::EnvTemplate {
            project,
            name,
            env_type,
        } => {
            handlers::env_template_subcommand(&monoops, project, name, env_type).await?;
        }
        MonoopsSubcommand::Daemon => {
            handlers::daemon_subcommand(&monoops).await?;
        }
    }

    Ok(())
}
