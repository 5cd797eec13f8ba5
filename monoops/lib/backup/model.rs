use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Files at or above this size are recorded in the manifest without a checksum.
pub const CHECKSUM_SIZE_LIMIT: u64 = 100 * 1024 * 1024;

/// Default gzip level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default days a backup is kept.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Default number of backups kept per project.
pub const DEFAULT_MAX_BACKUPS: usize = 10;

/// Names excluded from a backup unless the project configures its own list.
pub const DEFAULT_BACKUP_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "target",
    ".next",
    ".cache",
    "*.log",
    "*.tmp",
    "*.pyc",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Whether a backup stands alone or depends on a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Every included file.
    Full,

    /// Files changed since the parent backup.
    Incremental,
}

/// Where a backup is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Files are being collected and archived.
    InProgress,

    /// The archive and manifest are written.
    Completed,

    /// The backup did not complete.
    Failed,
}

/// A database engine whose data is dumped alongside the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// `pg_dump`.
    Postgres,

    /// `mysqldump`.
    Mysql,

    /// A file copy of the database.
    Sqlite,
}

/// How to reach a project's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// The engine.
    #[serde(rename = "type")]
    pub kind: DatabaseKind,

    /// Database name, for server engines.
    #[serde(default)]
    pub name: Option<String>,

    /// Server host.
    #[serde(default)]
    pub host: Option<String>,

    /// Server port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Login user.
    #[serde(default)]
    pub user: Option<String>,

    /// Name of the environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Database file relative to the project, for sqlite.
    #[serde(default)]
    pub path: Option<String>,
}

/// A project's backup settings, read from `.monoops/backup.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Glob patterns, relative to the project, of files to include.
    pub include: Vec<String>,

    /// Glob patterns matched against relative paths and path components.
    pub exclude: Vec<String>,

    /// gzip level, 0 to 9.
    pub compression_level: u32,

    /// Days before a backup expires.
    pub retention_days: i64,

    /// Backups kept per project, oldest removed first.
    pub max_backups: usize,

    /// Database to dump with each backup.
    pub database: Option<DatabaseConfig>,
}

/// One file recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the project root, `/`-separated.
    pub path: String,

    /// Size in bytes.
    pub size: u64,

    /// Modification time in milliseconds since the epoch.
    pub modified_ms: i64,

    /// SHA-256 of the contents, for files under the size limit.
    pub checksum: Option<String>,

    /// Whether the file's contents are in this backup's archive.
    pub archived: bool,
}

/// The file-level record of a backup.
///
/// Lists every file present when the backup ran, so the next incremental can compare against it;
/// `archived` marks the ones whose contents this backup carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// The backup.
    pub backup_id: String,

    /// The project.
    pub project_id: String,

    /// Full or incremental.
    pub backup_type: BackupType,

    /// The backup this one depends on.
    pub parent_backup_id: Option<String>,

    /// When the manifest was written.
    pub created_at: DateTime<Utc>,

    /// Every file seen, sorted by path.
    pub files: Vec<ManifestEntry>,
}

/// One backup and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique id, also the storage directory name.
    pub id: String,

    /// The project backed up.
    pub project_id: String,

    /// Full or incremental.
    pub backup_type: BackupType,

    /// Lifecycle state.
    pub status: BackupStatus,

    /// Uncompressed bytes archived.
    pub size_bytes: u64,

    /// Archive size on disk.
    pub compressed_size_bytes: u64,

    /// SHA-256 of the archive.
    pub checksum: Option<String>,

    /// Files carried in the archive.
    pub file_count: usize,

    /// The backup this one depends on.
    pub parent_backup_id: Option<String>,

    /// Caller-supplied labels.
    pub tags: Vec<String>,

    /// Storage directory.
    pub path: PathBuf,

    /// Database dump file name inside the storage directory.
    pub database_dump: Option<String>,

    /// Why the backup failed.
    pub error: Option<String>,

    /// When the backup started.
    pub created_at: DateTime<Utc>,

    /// When the backup completed or failed.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the backup expires.
    pub retention_until: DateTime<Utc>,
}

/// The result of checking a stored backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// The backup checked.
    pub backup_id: String,

    /// Whether every check passed.
    pub valid: bool,

    /// Whether the archive file exists.
    pub archive_exists: bool,

    /// Whether the archive hash matches the recorded checksum.
    pub checksum_matches: bool,

    /// Whether the archive size matches the recorded size.
    pub size_matches: bool,

    /// Whether the manifest parses and belongs to the backup.
    pub manifest_valid: bool,

    /// What went wrong.
    pub errors: Vec<String>,
}

/// The result of a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The backup requested.
    pub backup_id: String,

    /// Where files were written.
    pub target: PathBuf,

    /// Backups applied, oldest first.
    pub chain: Vec<String>,

    /// Files written across the chain.
    pub files_restored: usize,
}

/// A cron-triggered backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique id.
    pub id: String,

    /// The project to back up.
    pub project_id: String,

    /// Five-field cron expression.
    pub cron: String,

    /// Whether runs are incremental.
    pub incremental: bool,

    /// Tags given to each backup.
    pub tags: Vec<String>,

    /// Whether the scheduler runs the job.
    pub enabled: bool,

    /// The next trigger time.
    pub next_run: Option<DateTime<Utc>>,

    /// When the job last ran.
    pub last_run: Option<DateTime<Utc>>,

    /// Outcome of the last run.
    pub last_status: Option<BackupStatus>,

    /// Error of the last run.
    pub last_error: Option<String>,
}

/// What a retention pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Backup ids deleted.
    pub deleted: Vec<String>,

    /// Bytes of archives removed.
    pub freed_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackupManifest {
    /// Looks up an entry by path.
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Entries whose contents are in the archive.
    pub fn archived(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.files.iter().filter(|e| e.archived)
    }
}

impl ManifestEntry {
    /// Whether this file differs from `previous` by size or modification time.
    pub fn changed_since(&self, previous: &ManifestEntry) -> bool {
        self.size != previous.size || self.modified_ms != previous.modified_ms
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: DEFAULT_BACKUP_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            retention_days: DEFAULT_RETENTION_DAYS,
            max_backups: DEFAULT_MAX_BACKUPS,
            database: None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::InProgress => write!(f, "in_progress"),
            BackupStatus::Completed => write!(f, "completed"),
            BackupStatus::Failed => write!(f, "failed"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_config_yaml_keeps_defaults() -> anyhow::Result<()> {
        let config: BackupConfig = serde_yaml::from_str(
            "max_backups: 2\ndatabase:\n  type: sqlite\n  path: data/app.db\n",
        )?;

        assert_eq!(config.max_backups, 2);
        assert_eq!(config.include, vec!["**/*"]);
        assert!(config.exclude.iter().any(|e| e == "node_modules"));
        let database = config.database.expect("database");
        assert_eq!(database.kind, DatabaseKind::Sqlite);
        assert_eq!(database.path.as_deref(), Some("data/app.db"));
        Ok(())
    }

    #[test]
    fn test_manifest_lookup() {
        let entry = |path: &str, archived| ManifestEntry {
            path: path.into(),
            size: 1,
            modified_ms: 0,
            checksum: None,
            archived,
        };
        let manifest = BackupManifest {
            backup_id: "b".into(),
            project_id: "p".into(),
            backup_type: BackupType::Incremental,
            parent_backup_id: Some("a".into()),
            created_at: Utc::now(),
            files: vec![entry("a.txt", false), entry("b.txt", true), entry("src/c.rs", true)],
        };

        assert!(manifest.entry("b.txt").is_some());
        assert!(manifest.entry("missing").is_none());
        assert_eq!(manifest.archived().count(), 2);
    }
}
