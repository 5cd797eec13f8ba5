use std::path::PathBuf;

use clap::Parser;

use crate::{environment::EnvironmentType, resources::Priority};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// monoops - run, resource, deploy and back up the projects on this host
#[derive(Debug, Parser)]
#[command(name = "monoops", author, about, version, styles=styles::styles())]
pub struct MonoopsArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<MonoopsSubcommand>,

    /// Directory whose subdirectories are projects, when the settings file names none
    #[arg(long, global = true)]
    pub projects_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum MonoopsSubcommand {
    /// Start a project and keep it running in the foreground
    #[command(name = "start")]
    Start {
        /// The project to start
        project: String,

        /// Environment whose variables the process gets
        #[arg(short, long)]
        env: Option<String>,

        /// Command overriding the detected one
        #[arg(short, long)]
        command: Option<String>,

        /// Ports to allocate, in order
        #[arg(short, long)]
        port: Vec<u16>,
    },

    /// Stop a project
    #[command(name = "stop")]
    Stop {
        /// The project to stop
        project: String,

        /// Kill immediately instead of waiting for a graceful exit
        #[arg(short, long)]
        force: bool,
    },

    /// Restart a project and keep it running in the foreground
    #[command(name = "restart")]
    Restart {
        /// The project to restart
        project: String,

        /// Environment to switch to
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Show a project's status, or every tracked project
    #[command(name = "status")]
    Status {
        /// The project to inspect
        project: Option<String>,
    },

    /// Print the tail of a project's log
    #[command(name = "logs")]
    Logs {
        /// The project
        project: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,

        /// Environment whose log to read
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Grant resource limits to a project
    #[command(name = "allocate")]
    Allocate {
        /// The project
        project: String,

        /// Minimum CPU in percent of the host
        #[arg(long, default_value_t = 10.0)]
        min_cpu: f64,

        /// Maximum CPU in percent of the host
        #[arg(long, default_value_t = 50.0)]
        max_cpu: f64,

        /// Minimum memory in MB
        #[arg(long, default_value_t = 128)]
        min_memory: u64,

        /// Maximum memory in MB
        #[arg(long, default_value_t = 1024)]
        max_memory: u64,

        /// critical, high, normal, low or background
        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Adjust limits from observed usage
        #[arg(long)]
        auto_scale: bool,
    },

    /// Sample a project's current resource usage
    #[command(name = "usage")]
    Usage {
        /// The project
        project: String,
    },

    /// Predict a project's usage from its history
    #[command(name = "predict")]
    Predict {
        /// The project
        project: String,

        /// Hours ahead
        #[arg(long, default_value_t = 24.0)]
        hours: f64,
    },

    /// Recommend limit changes across projects
    #[command(name = "optimize")]
    Optimize {
        /// The projects to consider
        #[arg(required = true)]
        projects: Vec<String>,
    },

    /// Show host resources
    #[command(name = "system")]
    System,

    /// Run a project's deployment pipeline
    #[command(name = "deploy")]
    Deploy {
        /// The project
        project: String,

        /// Deployment target label
        #[arg(short, long, default_value = "production")]
        target: String,

        /// Environment whose variables the stages get
        #[arg(short, long)]
        env: Option<String>,

        /// Deploy to the inactive blue-green instance and switch on success
        #[arg(long)]
        blue_green: bool,
    },

    /// Roll a deployment back to the previous successful one
    #[command(name = "rollback")]
    Rollback {
        /// The deployment to roll back
        deployment_id: String,
    },

    /// List recorded deployments, newest first
    #[command(name = "deployments")]
    Deployments {
        /// Only this project
        #[arg(short, long)]
        project: Option<String>,

        /// Maximum entries
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Back up a project
    #[command(name = "backup")]
    Backup {
        /// The project
        project: String,

        /// Archive only files changed since the last backup
        #[arg(short, long)]
        incremental: bool,

        /// Labels for the backup
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Restore a backup into a directory
    #[command(name = "restore")]
    Restore {
        /// The backup to restore
        backup_id: String,

        /// Where to write files
        #[arg(short, long)]
        target: PathBuf,

        /// Only restore these relative paths
        #[arg(long = "path")]
        paths: Vec<String>,
    },

    /// Check a backup's archive and manifest
    #[command(name = "verify")]
    Verify {
        /// The backup
        backup_id: String,
    },

    /// List backups, newest first
    #[command(name = "backups")]
    Backups {
        /// Only this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Schedule cron-triggered backups, or list and remove schedules
    #[command(name = "schedule")]
    Schedule {
        /// The project to schedule
        #[arg(required_unless_present_any = ["list", "remove"])]
        project: Option<String>,

        /// Five-field cron expression, in UTC
        #[arg(long, required_unless_present_any = ["list", "remove"])]
        cron: Option<String>,

        /// Run incremental backups
        #[arg(short, long)]
        incremental: bool,

        /// Labels for each backup
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// List schedules
        #[arg(long, conflicts_with_all = ["project", "remove"])]
        list: bool,

        /// Remove the schedule with this id
        #[arg(long, conflicts_with = "project")]
        remove: Option<String>,
    },

    /// Delete expired backups
    #[command(name = "cleanup")]
    Cleanup {
        /// Also delete backups older than this many days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Make an environment the active one
    #[command(name = "env-switch")]
    EnvSwitch {
        /// The project
        project: String,

        /// The environment
        name: String,
    },

    /// Set variables on an environment
    #[command(name = "env-set")]
    EnvSet {
        /// The project
        project: String,

        /// The environment
        name: String,

        /// KEY=VALUE pairs
        #[arg(required = true, value_parser = parse_key_val)]
        variables: Vec<(String, String)>,
    },

    /// List a project's environments
    #[command(name = "env-list")]
    EnvList {
        /// The project
        project: String,
    },

    /// Create an environment with defaults for its type
    #[command(name = "env-template")]
    EnvTemplate {
        /// The project
        project: String,

        /// The environment
        name: String,

        /// development, staging, production or test; inferred from the name when omitted
        #[arg(long = "type")]
        env_type: Option<EnvironmentType>,
    },

    /// Run the backup scheduler and supervise adopted projects until interrupted
    #[command(name = "daemon")]
    Daemon,
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Parses a `KEY=VALUE` pair.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, found '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        MonoopsArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("URL=postgres://x?a=b"),
            Ok(("URL".to_string(), "postgres://x?a=b".to_string()))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_allocate_and_schedule() -> anyhow::Result<()> {
        let args = MonoopsArgs::try_parse_from([
            "monoops", "allocate", "shop", "--max-cpu", "80", "--priority", "high",
        ])?;
        match args.subcommand {
            Some(MonoopsSubcommand::Allocate {
                max_cpu, priority, ..
            }) => {
                assert_eq!(max_cpu, 80.0);
                assert_eq!(priority, Priority::High);
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = MonoopsArgs::try_parse_from(["monoops", "schedule", "--list"])?;
        assert!(matches!(
            args.subcommand,
            Some(MonoopsSubcommand::Schedule { list: true, .. })
        ));
        assert!(MonoopsArgs::try_parse_from(["monoops", "schedule", "shop"]).is_err());
        Ok(())
    }
}
