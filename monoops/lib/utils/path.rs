//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where monoops state is stored.
pub const MONOOPS_HOME_DIR: &str = ".monoops";

/// The environment variable that overrides the monoops home directory.
pub const MONOOPS_HOME_ENV_VAR: &str = "MONOOPS_HOME";

/// The global settings file inside the monoops home directory.
pub const SETTINGS_FILENAME: &str = "monoops.yaml";

/// The per-project directory holding monoops configuration files.
pub const PROJECT_CONFIG_DIR: &str = ".monoops";

/// The per-project startup configuration file.
pub const STARTUP_CONFIG_FILENAME: &str = "startup.yaml";

/// The per-project deployment configuration file.
pub const DEPLOY_CONFIG_FILENAME: &str = "deploy.yaml";

/// The per-project backup configuration file.
pub const BACKUP_CONFIG_FILENAME: &str = "backup.yaml";

/// The per-project directory of environment definition files.
pub const ENVIRONMENTS_SUBDIR: &str = "environments";

/// The legacy flat variable file materialized for the active environment.
pub const PRIMARY_ENV_FILENAME: &str = ".env";

/// The sub directory where process logs are written.
pub const LOG_SUBDIR: &str = "logs";

/// The sub directory where runtime state snapshots are written.
pub const STATE_SUBDIR: &str = "state";

/// The sub directory where deployment workspaces are created.
pub const DEPLOYMENTS_SUBDIR: &str = "deployments";

/// The sub directory where backups are stored.
pub const BACKUPS_SUBDIR: &str = "backups";

/// The sub directory where audit records are appended.
pub const AUDIT_SUBDIR: &str = "audit";

/// The backup metadata index file.
pub const BACKUP_INDEX_FILENAME: &str = "index.json";

/// The scheduled backup jobs file.
pub const SCHEDULES_FILENAME: &str = "schedules.json";

/// The blue-green records file.
pub const BLUE_GREEN_FILENAME: &str = "blue_green.json";

/// The archive file inside a backup directory.
pub const ARCHIVE_FILENAME: &str = "archive.tar.gz";

/// The manifest file inside a backup directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// The database dump directory inside a backup directory.
pub const DATABASE_SUBDIR: &str = "database";

/// The suffix given to backed-up configuration files before they are overwritten.
pub const BACKUP_FILE_SUFFIX: &str = "bak";
