use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::RwLock};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A project known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    /// The project id.
    pub id: String,

    /// The project's directory on disk.
    pub path: PathBuf,

    /// The type the discovery scanner declared, if any.
    pub declared_type: Option<String>,
}

/// Resolves project ids to filesystem paths.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    /// Looks up a project by id.
    async fn resolve(&self, project_id: &str) -> MonoopsResult<Option<ProjectEntry>>;

    /// Lists every known project.
    async fn list(&self) -> MonoopsResult<Vec<ProjectEntry>>;
}

/// A registry backed by explicit registrations and, optionally, a directory whose children are
/// projects named after their directory.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    root: Option<PathBuf>,
    registered: RwLock<HashMap<String, ProjectEntry>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalRegistry {
    /// Creates an empty registry with no projects root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that also scans `root` for project directories.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
            registered: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a project explicitly, replacing any previous registration with the same id.
    pub async fn register(
        &self,
        project_id: impl Into<String>,
        path: impl AsRef<Path>,
        declared_type: Option<String>,
    ) {
        let id = project_id.into();
        let entry = ProjectEntry {
            id: id.clone(),
            path: path.as_ref().to_path_buf(),
            declared_type,
        };
        self.registered.write().await.insert(id, entry);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a project or fails with `ProjectNotFound`.
pub async fn resolve_project(
    registry: &dyn ProjectRegistry,
    project_id: &str,
) -> MonoopsResult<ProjectEntry> {
    registry
        .resolve(project_id)
        .await?
        .ok_or_else(|| MonoopsError::ProjectNotFound(project_id.to_string()))
}

fn is_plain_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id != "."
        && project_id != ".."
        && !project_id.contains(['/', '\\'])
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProjectRegistry for LocalRegistry {
    async fn resolve(&self, project_id: &str) -> MonoopsResult<Option<ProjectEntry>> {
        if let Some(entry) = self.registered.read().await.get(project_id) {
            return Ok(Some(entry.clone()));
        }

        let Some(root) = &self.root else {
            return Ok(None);
        };

        if !is_plain_id(project_id) {
            return Ok(None);
        }

        let path = root.join(project_id);
        if fs::try_exists(&path).await? && fs::metadata(&path).await?.is_dir() {
            return Ok(Some(ProjectEntry {
                id: project_id.to_string(),
                path,
                declared_type: None,
            }));
        }

        Ok(None)
    }

    async fn list(&self) -> MonoopsResult<Vec<ProjectEntry>> {
        let mut entries: HashMap<String, ProjectEntry> = self.registered.read().await.clone();

        if let Some(root) = &self.root {
            if fs::try_exists(root).await? {
                let mut dir = fs::read_dir(root).await?;
                while let Some(entry) = dir.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                        continue;
                    }
                    entries.entry(name.clone()).or_insert(ProjectEntry {
                        id: name,
                        path: entry.path(),
                        declared_type: None,
                    });
                }
            }
        }

        let mut entries: Vec<_> = entries.into_values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
