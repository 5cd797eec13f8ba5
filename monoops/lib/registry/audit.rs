use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::MonoopsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of record kept in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A deployment result.
    Deployment,

    /// A resource allocation.
    Allocation,

    /// A backup.
    Backup,

    /// An environment change.
    Environment,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// What the record describes.
    pub kind: AuditKind,

    /// The project the record belongs to.
    pub project_id: String,

    /// When the record was written.
    pub recorded_at: DateTime<Utc>,

    /// The serialized entity.
    pub payload: serde_json::Value,
}

/// Persistence for audit and analytics.
///
/// Only a write-behind save and a most-recent-N read are needed.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persists a record.
    async fn save(&self, record: AuditRecord) -> MonoopsResult<()>;

    /// Returns up to `limit` records of `kind`, newest first.
    async fn recent(
        &self,
        kind: AuditKind,
        project_id: Option<&str>,
        limit: usize,
    ) -> MonoopsResult<Vec<AuditRecord>>;
}

/// An audit store that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

/// An audit store that appends one JSON line per record to `<dir>/<kind>.jsonl`.
#[derive(Debug)]
pub struct JsonlAuditStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AuditRecord {
    /// Creates a record, serializing `entity` as its payload.
    pub fn new<T: Serialize>(
        kind: AuditKind,
        project_id: impl Into<String>,
        entity: &T,
    ) -> MonoopsResult<Self> {
        Ok(Self {
            kind,
            project_id: project_id.into(),
            recorded_at: Utc::now(),
            payload: serde_json::to_value(entity)?,
        })
    }
}

impl MemoryAuditStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JsonlAuditStore {
    /// Creates a store writing under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, kind: AuditKind) -> PathBuf {
        let name = match kind {
            AuditKind::Deployment => "deployments",
            AuditKind::Allocation => "allocations",
            AuditKind::Backup => "backups",
            AuditKind::Environment => "environments",
        };
        self.dir.join(format!("{}.jsonl", name))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Saves a record in the background; failures are logged and otherwise ignored.
pub fn record_audit<T: Serialize>(
    store: &Arc<dyn AuditStore>,
    kind: AuditKind,
    project_id: &str,
    entity: &T,
) {
    let record = match AuditRecord::new(kind, project_id, entity) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(project_id, error = %e, "failed to serialize audit record");
            return;
        }
    };

    let store = Arc::clone(store);
    tokio::spawn(async move {
        if let Err(e) = store.save(record).await {
            tracing::warn!(error = %e, "failed to persist audit record");
        }
    });
}

fn select_recent(
    records: impl DoubleEndedIterator<Item = AuditRecord>,
    kind: AuditKind,
    project_id: Option<&str>,
    limit: usize,
) -> Vec<AuditRecord> {
    records
        .rev()
        .filter(|r| r.kind == kind && project_id.map_or(true, |id| r.project_id == id))
        .take(limit)
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn save(&self, record: AuditRecord) -> MonoopsResult<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn recent(
        &self,
        kind: AuditKind,
        project_id: Option<&str>,
        limit: usize,
    ) -> MonoopsResult<Vec<AuditRecord>> {
        let records = self.records.lock().await.clone();
        Ok(select_recent(records.into_iter(), kind, project_id, limit))
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn save(&self, record: AuditRecord) -> MonoopsResult<()> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(record.kind))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(
        &self,
        kind: AuditKind,
        project_id: Option<&str>,
        limit: usize,
    ) -> MonoopsResult<Vec<AuditRecord>> {
        let path = self.path_for(kind);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path).await?;
        let records: Vec<AuditRecord> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed audit line");
                    None
                }
            })
            .collect();

        Ok(select_recent(records.into_iter(), kind, project_id, limit))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_store_recent_newest_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonlAuditStore::new(dir.path());

        for i in 0..5 {
            let project = if i % 2 == 0 { "a" } else { "b" };
            store
                .save(AuditRecord::new(AuditKind::Backup, project, &i)?)
                .await?;
        }

        let recent = store.recent(AuditKind::Backup, Some("a"), 2).await?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, serde_json::json!(4));
        assert_eq!(recent[1].payload, serde_json::json!(2));
        assert!(store
            .recent(AuditKind::Deployment, None, 10)
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_filters_kind() -> anyhow::Result<()> {
        let store = MemoryAuditStore::new();
        store
            .save(AuditRecord::new(AuditKind::Allocation, "a", &"x")?)
            .await?;
        store
            .save(AuditRecord::new(AuditKind::Deployment, "a", &"y")?)
            .await?;

        let recent = store.recent(AuditKind::Deployment, None, 10).await?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].payload, serde_json::json!("y"));
        Ok(())
    }
}
