use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    sync::{Mutex, OnceCell, RwLock},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{self, Settings},
    registry::{self, record_audit, AuditKind, AuditStore, ProjectRegistry},
    utils::{
        self, OperationSlots, ARCHIVE_FILENAME, BACKUP_CONFIG_FILENAME, BACKUP_INDEX_FILENAME,
        DATABASE_SUBDIR, MANIFEST_FILENAME, SCHEDULES_FILENAME,
    },
    MonoopsError, MonoopsResult,
};

use super::{
    archive, database, Backup, BackupConfig, BackupManifest, BackupStatus, BackupType,
    CleanupReport, CronSchedule, RestoreOutcome, ScheduledJob, VerificationReport,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, restores, verifies, expires and schedules project backups.
///
/// Storage lives under `$MONOOPS_HOME/backups/`: one directory per backup holding the archive and
/// manifest, plus `index.json` with the metadata of every backup.
pub struct BackupCoordinator {
    settings: Settings,
    registry: Arc<dyn ProjectRegistry>,
    audit: Arc<dyn AuditStore>,
    slots: OperationSlots,

    /// The metadata index, read from disk on first use.
    index: RwLock<BackupIndex>,
    index_loaded: OnceCell<()>,

    /// Scheduled jobs keyed by id, read from disk on first use.
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
    jobs_loaded: OnceCell<()>,

    /// Serializes backup and cleanup for the same project.
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// The persisted metadata index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BackupIndex {
    /// Backups keyed by id.
    backups: BTreeMap<String, Backup>,

    /// Backup ids per project, oldest first.
    projects: BTreeMap<String, Vec<String>>,
}

/// What the blocking part of a backup produced.
struct ArchiveOutcome {
    size_bytes: u64,
    compressed_size_bytes: u64,
    checksum: String,
    file_count: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackupCoordinator {
    /// Creates a coordinator.
    pub fn new(
        settings: Settings,
        registry: Arc<dyn ProjectRegistry>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let slots = OperationSlots::new("backup", *settings.get_max_concurrent_backups());
        Self {
            settings,
            registry,
            audit,
            slots,
            index: RwLock::new(BackupIndex::default()),
            index_loaded: OnceCell::new(),
            jobs: RwLock::new(BTreeMap::new()),
            jobs_loaded: OnceCell::new(),
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Backs up a project.
    ///
    /// The backup is incremental when `incremental` is set and the project has a completed
    /// backup to build on; otherwise it is full. Archive and dump failures are reported through a
    /// `Failed` backup rather than an error.
    pub async fn backup_project(
        &self,
        project_id: &str,
        incremental: bool,
        tags: Vec<String>,
    ) -> MonoopsResult<Backup> {
        let _slot = self.slots.try_acquire()?;
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        self.ensure_index().await?;

        let entry = registry::resolve_project(self.registry.as_ref(), project_id).await?;
        let config: BackupConfig =
            config::load_project_config(&entry.path, BACKUP_CONFIG_FILENAME)
                .await?
                .unwrap_or_default();

        let parent = if incremental {
            self.latest_completed(project_id).await
        } else {
            None
        };
        let parent_manifest = match &parent {
            Some(parent) => Some(self.read_manifest(parent).await?),
            None => None,
        };
        let backup_type = if parent.is_some() {
            BackupType::Incremental
        } else {
            BackupType::Full
        };

        let now = Utc::now();
        let id = format!(
            "{}-{}-{}",
            project_id,
            now.format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.settings.backups_dir().join(&id);
        let mut backup = Backup {
            id: id.clone(),
            project_id: project_id.to_string(),
            backup_type,
            status: BackupStatus::InProgress,
            size_bytes: 0,
            compressed_size_bytes: 0,
            checksum: None,
            file_count: 0,
            parent_backup_id: parent.as_ref().map(|p| p.id.clone()),
            tags,
            path: dir.clone(),
            database_dump: None,
            error: None,
            created_at: now,
            completed_at: None,
            retention_until: now + ChronoDuration::days(config.retention_days),
        };

        tracing::info!(backup_id = %id, project_id, %backup_type, "starting backup");
        fs::create_dir_all(&dir).await?;
        self.upsert(&backup).await?;

        let manifest = BackupManifest {
            backup_id: id.clone(),
            project_id: project_id.to_string(),
            backup_type,
            parent_backup_id: backup.parent_backup_id.clone(),
            created_at: now,
            files: Vec::new(),
        };

        let result = async {
            let outcome =
                write_backup(entry.path.clone(), dir.clone(), config.clone(), manifest, parent_manifest)
                    .await?;
            let dump = match &config.database {
                Some(database) => Some(
                    database::dump_database(
                        database,
                        &entry.path,
                        &dir.join(DATABASE_SUBDIR),
                        self.settings.command_timeout(),
                    )
                    .await?,
                ),
                None => None,
            };
            Ok::<_, MonoopsError>((outcome, dump))
        }
        .await;

        backup.completed_at = Some(Utc::now());
        match result {
            Ok((outcome, dump)) => {
                backup.status = BackupStatus::Completed;
                backup.size_bytes = outcome.size_bytes;
                backup.compressed_size_bytes = outcome.compressed_size_bytes;
                backup.checksum = Some(outcome.checksum);
                backup.file_count = outcome.file_count;
                backup.database_dump = dump;
                tracing::info!(
                    backup_id = %id,
                    files = backup.file_count,
                    bytes = backup.size_bytes,
                    compressed = backup.compressed_size_bytes,
                    "backup completed"
                );
            }
            Err(e) => {
                tracing::error!(backup_id = %id, error = %e, "backup failed");
                backup.status = BackupStatus::Failed;
                backup.error = Some(e.to_string());
            }
        }

        self.upsert(&backup).await?;
        record_audit(&self.audit, AuditKind::Backup, project_id, &backup);

        if backup.status == BackupStatus::Completed {
            let removed = self.enforce_max_backups(project_id, config.max_backups).await?;
            if !removed.deleted.is_empty() {
                tracing::info!(project_id, deleted = ?removed.deleted, "trimmed old backups");
            }
        }

        Ok(backup)
    }

    /// Restores a backup into `target`, replaying its chain oldest first.
    ///
    /// With `selective`, only entries at or below those relative paths are written.
    pub async fn restore_project(
        &self,
        backup_id: &str,
        target: impl AsRef<Path>,
        selective: Option<Vec<String>>,
    ) -> MonoopsResult<RestoreOutcome> {
        self.ensure_index().await?;
        let target = target.as_ref().to_path_buf();
        let chain = self.backup_chain(backup_id).await?;

        let archives: Vec<(String, PathBuf)> = chain
            .iter()
            .map(|b| (b.id.clone(), b.path.join(ARCHIVE_FILENAME)))
            .collect();
        let ids: Vec<String> = chain.iter().map(|b| b.id.clone()).collect();

        let extract_target = target.clone();
        let files_restored = tokio::task::spawn_blocking(move || -> MonoopsResult<usize> {
            let mut total = 0;
            for (id, archive_path) in archives {
                let count =
                    archive::extract_archive(&archive_path, &extract_target, selective.as_deref())?;
                tracing::debug!(backup_id = %id, files = count, "applied backup");
                total += count;
            }
            Ok(total)
        })
        .await??;

        tracing::info!(backup_id, target = %target.display(), chain = ?ids, files_restored, "restore completed");
        Ok(RestoreOutcome {
            backup_id: backup_id.to_string(),
            target,
            chain: ids,
            files_restored,
        })
    }

    /// Checks a backup's archive and manifest against its metadata.
    ///
    /// Problems are reported in the returned report; only an unknown id is an error.
    pub async fn verify_backup(&self, backup_id: &str) -> MonoopsResult<VerificationReport> {
        let backup = self.get_backup(backup_id).await?;
        let mut report = VerificationReport {
            backup_id: backup_id.to_string(),
            valid: false,
            archive_exists: false,
            checksum_matches: false,
            size_matches: false,
            manifest_valid: false,
            errors: Vec::new(),
        };

        if backup.status != BackupStatus::Completed {
            report
                .errors
                .push(format!("backup status is {}", backup.status));
        }

        let archive_path = backup.path.join(ARCHIVE_FILENAME);
        report.archive_exists = fs::try_exists(&archive_path).await?;
        if report.archive_exists {
            let size = fs::metadata(&archive_path).await?.len();
            report.size_matches = size == backup.compressed_size_bytes;
            if !report.size_matches {
                report.errors.push(format!(
                    "archive is {} bytes, expected {}",
                    size, backup.compressed_size_bytes
                ));
            }

            let checksum = utils::get_file_hash(&archive_path).await?;
            report.checksum_matches = backup.checksum.as_deref() == Some(checksum.as_str());
            if !report.checksum_matches {
                report.errors.push("archive checksum mismatch".to_string());
            }
        } else {
            report.errors.push("archive missing".to_string());
        }

        match self.read_manifest(&backup).await {
            Ok(manifest) => {
                let archived = manifest.archived().count();
                let sorted = manifest.files.windows(2).all(|w| w[0].path < w[1].path);
                report.manifest_valid = manifest.backup_id == backup.id
                    && manifest.project_id == backup.project_id
                    && manifest.backup_type == backup.backup_type
                    && archived == backup.file_count
                    && sorted;
                if !report.manifest_valid {
                    report.errors.push("manifest does not match metadata".to_string());
                }
            }
            Err(e) => report.errors.push(format!("manifest unreadable: {}", e)),
        }

        report.valid = report.errors.is_empty();
        if !report.valid {
            tracing::warn!(backup_id, errors = ?report.errors, "backup verification failed");
        }
        Ok(report)
    }

    /// Backups newest first, optionally for one project.
    pub async fn list_backups(&self, project_id: Option<&str>) -> MonoopsResult<Vec<Backup>> {
        self.ensure_index().await?;
        let mut backups: Vec<Backup> = self
            .index
            .read()
            .await
            .backups
            .values()
            .filter(|b| project_id.map_or(true, |id| b.project_id == id))
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Returns one backup's metadata.
    pub async fn get_backup(&self, backup_id: &str) -> MonoopsResult<Backup> {
        self.ensure_index().await?;
        self.index
            .read()
            .await
            .backups
            .get(backup_id)
            .cloned()
            .ok_or_else(|| MonoopsError::BackupNotFound(backup_id.to_string()))
    }

    /// Deletes backups past their retention date or older than `days`.
    ///
    /// A backup another surviving backup depends on is kept.
    pub async fn cleanup_old_backups(&self, days: i64) -> MonoopsResult<CleanupReport> {
        self.ensure_index().await?;
        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(days);

        let projects: Vec<String> = self.index.read().await.projects.keys().cloned().collect();
        let mut report = CleanupReport::default();

        for project_id in projects {
            let lock = self.project_lock(&project_id).await;
            let _guard = lock.lock().await;

            // Newest first so dependents go before their parents.
            let mut expired: Vec<Backup> = self
                .list_backups(Some(&project_id))
                .await?
                .into_iter()
                .filter(|b| b.retention_until <= now || b.created_at < cutoff)
                .collect();
            expired.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            for backup in expired {
                if self.has_dependents(&backup.id).await {
                    tracing::debug!(backup_id = %backup.id, "kept expired backup with dependents");
                    continue;
                }
                report.freed_bytes += self.remove_backup(&backup).await?;
                report.deleted.push(backup.id);
            }
        }

        tracing::info!(deleted = report.deleted.len(), freed_bytes = report.freed_bytes, "cleanup finished");
        Ok(report)
    }

    /// Registers a cron-triggered backup.
    pub async fn schedule_backup(
        &self,
        project_id: &str,
        cron: &str,
        incremental: bool,
        tags: Vec<String>,
    ) -> MonoopsResult<ScheduledJob> {
        let schedule = CronSchedule::parse(cron)?;
        registry::resolve_project(self.registry.as_ref(), project_id).await?;
        self.ensure_jobs().await?;

        let job = ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            cron: cron.trim().to_string(),
            incremental,
            tags,
            enabled: true,
            next_run: schedule.next_after(Utc::now()),
            last_run: None,
            last_status: None,
            last_error: None,
        };

        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        self.save_jobs(&jobs).await?;

        tracing::info!(job_id = %job.id, project_id, cron, next_run = ?job.next_run, "scheduled backup");
        Ok(job)
    }

    /// Removes a scheduled job, returning it if it existed.
    pub async fn unschedule_backup(&self, job_id: &str) -> MonoopsResult<Option<ScheduledJob>> {
        self.ensure_jobs().await?;
        let mut jobs = self.jobs.write().await;
        let removed = jobs.remove(job_id);
        if removed.is_some() {
            self.save_jobs(&jobs).await?;
        }
        Ok(removed)
    }

    /// Scheduled jobs ordered by id.
    pub async fn list_schedules(&self) -> MonoopsResult<Vec<ScheduledJob>> {
        self.ensure_jobs().await?;
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    /// Runs every enabled job due at `now` once, then moves its next run past `now`.
    ///
    /// Missed trigger times are not backfilled. Returns the ids of the jobs that ran.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> MonoopsResult<Vec<String>> {
        self.ensure_jobs().await?;
        let due: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.enabled && j.next_run.is_some_and(|next| next <= now))
            .cloned()
            .collect();

        let mut ran = Vec::new();
        for job in due {
            tracing::info!(job_id = %job.id, project_id = %job.project_id, "running scheduled backup");
            let outcome = self
                .backup_project(&job.project_id, job.incremental, job.tags.clone())
                .await;

            let next_run = CronSchedule::parse(&job.cron)
                .ok()
                .and_then(|s| s.next_after(now));

            let mut jobs = self.jobs.write().await;
            if let Some(stored) = jobs.get_mut(&job.id) {
                stored.last_run = Some(now);
                stored.next_run = next_run;
                match outcome {
                    Ok(backup) => {
                        stored.last_status = Some(backup.status);
                        stored.last_error = backup.error;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "scheduled backup failed");
                        stored.last_status = Some(BackupStatus::Failed);
                        stored.last_error = Some(e.to_string());
                    }
                }
            }
            self.save_jobs(&jobs).await?;
            ran.push(job.id);
        }

        Ok(ran)
    }

    /// Starts the scheduler loop, which wakes every scheduler interval until `token` is
    /// cancelled.
    pub fn start_scheduler(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let interval = this.settings.scheduler_interval();
            tracing::info!(interval_secs = interval.as_secs(), "backup scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(interval) => {}
                }
                if let Err(e) = this.run_due_jobs(Utc::now()).await {
                    tracing::error!(error = %e, "scheduler pass failed");
                }
            }
            tracing::info!("backup scheduler stopped");
        })
    }

    /// The backups to apply for `backup_id`, oldest first, starting at the nearest full backup.
    async fn backup_chain(&self, backup_id: &str) -> MonoopsResult<Vec<Backup>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(backup_id.to_string());

        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                return Err(MonoopsError::VerificationFailed(format!(
                    "backup chain of {} loops at {}",
                    backup_id, id
                )));
            }

            let backup = self.get_backup(&id).await?;
            if backup.status != BackupStatus::Completed {
                return Err(MonoopsError::Validation(format!(
                    "backup {} is {}",
                    backup.id, backup.status
                )));
            }

            current = match backup.backup_type {
                BackupType::Full => None,
                BackupType::Incremental => Some(backup.parent_backup_id.clone().ok_or_else(|| {
                    MonoopsError::VerificationFailed(format!(
                        "incremental backup {} has no parent",
                        backup.id
                    ))
                })?),
            };
            chain.push(backup);
        }

        chain.reverse();
        Ok(chain)
    }

    async fn latest_completed(&self, project_id: &str) -> Option<Backup> {
        self.index
            .read()
            .await
            .backups
            .values()
            .filter(|b| b.project_id == project_id && b.status == BackupStatus::Completed)
            .max_by_key(|b| b.created_at)
            .cloned()
    }

    async fn read_manifest(&self, backup: &Backup) -> MonoopsResult<BackupManifest> {
        let bytes = fs::read(backup.path.join(MANIFEST_FILENAME)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Removes the oldest backups beyond `max`, keeping any a survivor depends on.
    async fn enforce_max_backups(
        &self,
        project_id: &str,
        max: usize,
    ) -> MonoopsResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let backups = self.list_backups(Some(project_id)).await?;
        if backups.len() <= max {
            return Ok(report);
        }

        // Oldest first among those beyond the newest `max`.
        let mut excess: Vec<Backup> = backups.into_iter().skip(max).collect();
        excess.reverse();

        for backup in excess {
            if self.has_dependents(&backup.id).await {
                continue;
            }
            report.freed_bytes += self.remove_backup(&backup).await?;
            report.deleted.push(backup.id);
        }
        Ok(report)
    }

    async fn has_dependents(&self, backup_id: &str) -> bool {
        self.index
            .read()
            .await
            .backups
            .values()
            .any(|b| b.parent_backup_id.as_deref() == Some(backup_id))
    }

    /// Deletes a backup's files and metadata. Returns the archive bytes freed.
    async fn remove_backup(&self, backup: &Backup) -> MonoopsResult<u64> {
        if fs::try_exists(&backup.path).await? {
            fs::remove_dir_all(&backup.path).await?;
        }

        let mut index = self.index.write().await;
        index.backups.remove(&backup.id);
        if let Some(ids) = index.projects.get_mut(&backup.project_id) {
            ids.retain(|id| id != &backup.id);
            if ids.is_empty() {
                index.projects.remove(&backup.project_id);
            }
        }
        self.save_index(&index).await?;

        tracing::info!(backup_id = %backup.id, "deleted backup");
        Ok(backup.compressed_size_bytes)
    }

    async fn upsert(&self, backup: &Backup) -> MonoopsResult<()> {
        let mut index = self.index.write().await;
        index.backups.insert(backup.id.clone(), backup.clone());
        let ids = index.projects.entry(backup.project_id.clone()).or_default();
        if !ids.contains(&backup.id) {
            ids.push(backup.id.clone());
        }
        self.save_index(&index).await
    }

    async fn ensure_index(&self) -> MonoopsResult<()> {
        self.index_loaded
            .get_or_try_init(|| async {
                let path = self.settings.backups_dir().join(BACKUP_INDEX_FILENAME);
                if fs::try_exists(&path).await? {
                    let loaded: BackupIndex = serde_json::from_slice(&fs::read(&path).await?)?;
                    tracing::debug!(count = loaded.backups.len(), "loaded backup index");
                    *self.index.write().await = loaded;
                }
                Ok::<_, MonoopsError>(())
            })
            .await?;
        Ok(())
    }

    async fn save_index(&self, index: &BackupIndex) -> MonoopsResult<()> {
        let dir = self.settings.backups_dir();
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(BACKUP_INDEX_FILENAME), serde_json::to_vec_pretty(index)?).await?;
        Ok(())
    }

    async fn ensure_jobs(&self) -> MonoopsResult<()> {
        self.jobs_loaded
            .get_or_try_init(|| async {
                let path = self.settings.backups_dir().join(SCHEDULES_FILENAME);
                if fs::try_exists(&path).await? {
                    let loaded: BTreeMap<String, ScheduledJob> =
                        serde_json::from_slice(&fs::read(&path).await?)?;
                    *self.jobs.write().await = loaded;
                }
                Ok::<_, MonoopsError>(())
            })
            .await?;
        Ok(())
    }

    async fn save_jobs(&self, jobs: &BTreeMap<String, ScheduledJob>) -> MonoopsResult<()> {
        let dir = self.settings.backups_dir();
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(SCHEDULES_FILENAME), serde_json::to_vec_pretty(jobs)?).await?;
        Ok(())
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Scans, filters, archives and hashes on the blocking pool, writing the manifest last.
async fn write_backup(
    project_path: PathBuf,
    dir: PathBuf,
    config: BackupConfig,
    mut manifest: BackupManifest,
    parent: Option<BackupManifest>,
) -> MonoopsResult<ArchiveOutcome> {
    tokio::task::spawn_blocking(move || -> MonoopsResult<ArchiveOutcome> {
        let mut files = archive::scan_files(&project_path, &config)?;
        if let Some(parent) = &parent {
            archive::mark_changed(&mut files, parent);
        }

        let archive_path = dir.join(ARCHIVE_FILENAME);
        let size_bytes =
            archive::write_archive(&project_path, &files, &archive_path, config.compression_level)?;
        let compressed_size_bytes = std::fs::metadata(&archive_path)?.len();
        let checksum = utils::hash_file_blocking(&archive_path)?;
        let file_count = files.iter().filter(|f| f.archived).count();

        manifest.files = files;
        std::fs::write(dir.join(MANIFEST_FILENAME), serde_json::to_vec_pretty(&manifest)?)?;

        Ok(ArchiveOutcome {
            size_bytes,
            compressed_size_bytes,
            checksum,
            file_count,
        })
    })
    .await?
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::registry::{LocalRegistry, MemoryAuditStore};

    struct Fixture {
        home: TempDir,
        projects: TempDir,
        coordinator: Arc<BackupCoordinator>,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let home = tempfile::tempdir()?;
        let projects = tempfile::tempdir()?;
        std::fs::create_dir_all(projects.path().join("shop/src"))?;
        std::fs::write(projects.path().join("shop/a.txt"), "alpha")?;
        std::fs::write(projects.path().join("shop/src/b.txt"), "bravo")?;

        let settings = Settings::builder().home_dir(home.path()).build();
        let coordinator = BackupCoordinator::new(
            settings,
            Arc::new(LocalRegistry::with_root(projects.path())),
            Arc::new(MemoryAuditStore::new()),
        );
        Ok(Fixture {
            home,
            projects,
            coordinator: Arc::new(coordinator),
        })
    }

    #[tokio::test]
    async fn test_incremental_without_parent_is_full() -> anyhow::Result<()> {
        let f = fixture()?;
        let backup = f.coordinator.backup_project("shop", true, vec![]).await?;
        assert_eq!(backup.backup_type, BackupType::Full);
        assert_eq!(backup.status, BackupStatus::Completed);
        assert_eq!(backup.file_count, 2);
        assert!(backup.parent_backup_id.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() -> anyhow::Result<()> {
        let f = fixture()?;
        let backup = f.coordinator.backup_project("shop", false, vec!["nightly".into()]).await?;

        let report = f.coordinator.verify_backup(&backup.id).await?;
        assert!(report.valid, "{:?}", report.errors);

        std::fs::write(backup.path.join(ARCHIVE_FILENAME), "garbage")?;
        let report = f.coordinator.verify_backup(&backup.id).await?;
        assert!(!report.valid);
        assert!(report.archive_exists);
        assert!(!report.checksum_matches);
        assert!(!report.size_matches);

        std::fs::remove_file(backup.path.join(ARCHIVE_FILENAME))?;
        let report = f.coordinator.verify_backup(&backup.id).await?;
        assert!(!report.archive_exists);

        assert!(matches!(
            f.coordinator.verify_backup("nope").await,
            Err(MonoopsError::BackupNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_max_backups_trims_oldest_full() -> anyhow::Result<()> {
        let f = fixture()?;
        let config_dir = f.projects.path().join("shop/.monoops");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::write(config_dir.join(BACKUP_CONFIG_FILENAME), "max_backups: 2\n")?;

        let first = f.coordinator.backup_project("shop", false, vec![]).await?;
        f.coordinator.backup_project("shop", false, vec![]).await?;
        f.coordinator.backup_project("shop", false, vec![]).await?;

        let remaining = f.coordinator.list_backups(Some("shop")).await?;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|b| b.id != first.id));
        assert!(!first.path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_keeps_parents_of_survivors() -> anyhow::Result<()> {
        let f = fixture()?;
        let full = f.coordinator.backup_project("shop", false, vec![]).await?;
        std::fs::write(f.projects.path().join("shop/a.txt"), "alpha two")?;
        let incremental = f.coordinator.backup_project("shop", true, vec![]).await?;
        assert_eq!(incremental.parent_backup_id.as_deref(), Some(full.id.as_str()));

        // Expire only the full backup.
        {
            let mut index = f.coordinator.index.write().await;
            index.backups.get_mut(&full.id).unwrap().retention_until = Utc::now() - ChronoDuration::days(1);
        }
        let report = f.coordinator.cleanup_old_backups(365).await?;
        assert!(report.deleted.is_empty());

        let report = f.coordinator.cleanup_old_backups(-1).await?;
        assert_eq!(report.deleted, vec![incremental.id.clone(), full.id.clone()]);
        assert!(f.coordinator.list_backups(None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_index_and_schedules_persist() -> anyhow::Result<()> {
        let f = fixture()?;
        let backup = f.coordinator.backup_project("shop", false, vec![]).await?;
        let job = f.coordinator.schedule_backup("shop", "0 3 * * *", true, vec![]).await?;
        assert!(job.next_run.is_some());

        let reopened = BackupCoordinator::new(
            Settings::builder().home_dir(f.home.path()).build(),
            Arc::new(LocalRegistry::with_root(f.projects.path())),
            Arc::new(MemoryAuditStore::new()),
        );
        assert_eq!(reopened.get_backup(&backup.id).await?.checksum, backup.checksum);
        assert_eq!(reopened.list_schedules().await?, vec![job.clone()]);

        assert!(reopened.unschedule_backup(&job.id).await?.is_some());
        assert!(reopened.list_schedules().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_cron() -> anyhow::Result<()> {
        let f = fixture()?;
        let err = f
            .coordinator
            .schedule_backup("shop", "every day", false, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MonoopsError::InvalidCronExpression { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_due_jobs_run_once_and_skip_missed_windows() -> anyhow::Result<()> {
        let f = fixture()?;
        let job = f.coordinator.schedule_backup("shop", "* * * * *", false, vec![]).await?;

        // A day later: many windows were missed, one run happens.
        let later = Utc::now() + ChronoDuration::days(1);
        let ran = f.coordinator.run_due_jobs(later).await?;
        assert_eq!(ran, vec![job.id.clone()]);

        let stored = f.coordinator.list_schedules().await?.remove(0);
        assert_eq!(stored.last_status, Some(BackupStatus::Completed));
        assert!(stored.next_run.is_some_and(|next| next > later));
        assert_eq!(f.coordinator.list_backups(Some("shop")).await?.len(), 1);

        assert!(f.coordinator.run_due_jobs(later).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrency_limit() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let coordinator = BackupCoordinator::new(
            Settings::builder()
                .home_dir(home.path())
                .max_concurrent_backups(0)
                .build(),
            Arc::new(LocalRegistry::new()),
            Arc::new(MemoryAuditStore::new()),
        );
        assert!(matches!(
            coordinator.backup_project("shop", false, vec![]).await,
            Err(MonoopsError::TooManyConcurrentOperations { .. })
        ));
        Ok(())
    }
}
