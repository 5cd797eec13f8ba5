use std::{path::PathBuf, sync::Arc};

use getset::Getters;

use crate::{
    backup::BackupCoordinator,
    config::Settings,
    deployment::DeploymentAssistant,
    environment::EnvironmentManager,
    launcher::ProcessLauncher,
    registry::{AuditStore, JsonlAuditStore, LocalRegistry, ProjectRegistry},
    resources::ResourceAllocator,
    runtime::SystemProbe,
    MonoopsResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Every component sharing one settings value, one registry and one audit store.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Monoops {
    /// Host-wide settings.
    settings: Settings,

    /// Project lookup.
    registry: Arc<dyn ProjectRegistry>,

    /// Audit persistence.
    audit: Arc<dyn AuditStore>,

    /// Named variable sets per project.
    environments: Arc<EnvironmentManager>,

    /// Process lifecycle.
    launcher: Arc<ProcessLauncher>,

    /// Resource limits, usage history and auto-scaling.
    allocator: Arc<ResourceAllocator>,

    /// Deployment pipelines.
    deployments: Arc<DeploymentAssistant>,

    /// Backups and their schedules.
    backups: Arc<BackupCoordinator>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Monoops {
    /// Wires the components around the given collaborators.
    pub fn new(
        settings: Settings,
        registry: Arc<dyn ProjectRegistry>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let probe = Arc::new(SystemProbe::new());
        let environments = Arc::new(EnvironmentManager::new(
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));
        let launcher = Arc::new(ProcessLauncher::new(
            settings.clone(),
            Arc::clone(&registry),
            Arc::clone(&environments),
            Arc::clone(&probe),
        ));
        let allocator = Arc::new(ResourceAllocator::new(
            settings.clone(),
            Arc::clone(&launcher),
            probe,
            Arc::clone(&audit),
        ));
        let deployments = Arc::new(DeploymentAssistant::new(
            settings.clone(),
            Arc::clone(&registry),
            Arc::clone(&environments),
            Arc::clone(&audit),
        ));
        let backups = Arc::new(BackupCoordinator::new(
            settings.clone(),
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));

        Self {
            settings,
            registry,
            audit,
            environments,
            launcher,
            allocator,
            deployments,
            backups,
        }
    }

    /// Wires the components with the local registry and the JSONL audit log under the home
    /// directory.
    ///
    /// Projects are the subdirectories of the configured projects root, or of `fallback_root`
    /// when none is configured.
    pub fn from_settings(settings: Settings, fallback_root: impl Into<PathBuf>) -> Self {
        let root = settings
            .get_projects_root()
            .clone()
            .unwrap_or_else(|| fallback_root.into());
        tracing::debug!(projects_root = %root.display(), home = %settings.get_home_dir().display(), "wiring components");

        let registry: Arc<dyn ProjectRegistry> = Arc::new(LocalRegistry::with_root(root));
        let audit: Arc<dyn AuditStore> = Arc::new(JsonlAuditStore::new(settings.audit_dir()));
        Self::new(settings, registry, audit)
    }

    /// Loads settings from `MONOOPS_HOME` and wires the default collaborators.
    pub async fn load(fallback_root: impl Into<PathBuf>) -> MonoopsResult<Self> {
        let settings = Settings::load_default().await?;
        Ok(Self::from_settings(settings, fallback_root))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_components_share_the_registry() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let projects = tempfile::tempdir()?;
        std::fs::create_dir(projects.path().join("shop"))?;

        let monoops =
            Monoops::from_settings(Settings::builder().home_dir(home.path()).build(), projects.path());

        let entry = monoops.get_registry().resolve("shop").await?;
        assert!(entry.is_some());
        assert!(monoops.get_launcher().registry().resolve("shop").await?.is_some());
        assert!(monoops.get_backups().list_backups(None).await?.is_empty());
        Ok(())
    }
}
