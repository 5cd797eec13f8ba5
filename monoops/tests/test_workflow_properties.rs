use std::{collections::HashMap, sync::Arc};

use monoops::{
    config::Settings,
    deployment::{DeploymentConfig, DeploymentStatus, HealthCheck},
    environment::{EnvironmentManager, EnvironmentType},
    management::Monoops,
    registry::{LocalRegistry, MemoryAuditStore, ProjectRegistry},
    MonoopsError,
};
use tempfile::{tempdir, TempDir};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_at_most_one_environment_is_active() -> anyhow::Result<()> {
    let (_home, projects, monoops) = setup()?;
    let environments = monoops.get_environments();

    for name in ["development", "staging", "production"] {
        environments
            .set_variables(
                "shop",
                name,
                &HashMap::from([("APP_NAME".to_string(), format!("shop-{}", name))]),
            )
            .await?;
    }
    environments
        .create_environment_template("shop", "qa", EnvironmentType::Test)
        .await?;

    let sequence = ["staging", "production", "staging", "qa", "development", "development"];
    for name in sequence {
        let outcome = environments.switch_environment("shop", name).await?;
        assert!(outcome.success);

        let active: Vec<_> = environments
            .list_environments("shop")
            .await?
            .into_iter()
            .filter(|e| *e.get_active())
            .map(|e| e.get_name().clone())
            .collect();
        assert_eq!(active, vec![name.to_string()]);
    }

    // The invariant also holds for what was persisted.
    let registry: Arc<dyn ProjectRegistry> = Arc::new(LocalRegistry::with_root(projects.path()));
    let reloaded = EnvironmentManager::new(registry, Arc::new(MemoryAuditStore::new()));
    let active = reloaded.get_active_environment("shop").await?;
    assert_eq!(active.map(|e| e.get_name().clone()).as_deref(), Some("development"));

    let env_file = std::fs::read_to_string(projects.path().join("shop/.env"))?;
    assert!(env_file.contains("APP_NAME=shop-development"));

    assert!(matches!(
        environments.switch_environment("shop", "missing").await,
        Err(MonoopsError::EnvironmentNotFound { .. })
    ));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unhealthy_deployment_rolls_back_to_previous_success() -> anyhow::Result<()> {
    let (_home, projects, monoops) = setup()?;
    let deployments = monoops.get_deployments();
    let marker = projects.path().join("shop/healthy");

    std::fs::write(&marker, "")?;
    let good = deployments
        .deploy("shop", "local", None, Some(config()))
        .await?;
    assert_eq!(good.status, DeploymentStatus::Success, "{:#?}", good.logs);

    std::fs::remove_file(&marker)?;
    std::fs::write(projects.path().join("shop/index.html"), "v2")?;
    let bad = deployments
        .deploy("shop", "local", None, Some(config()))
        .await?;

    assert_eq!(bad.status, DeploymentStatus::RolledBack, "{:#?}", bad.logs);
    let rollback_id = bad
        .rollback_deployment_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no rollback deployment"))?;

    let rollback = deployments.get_deployment_status(&rollback_id).await?;
    assert_eq!(rollback.status, DeploymentStatus::Success);
    assert_eq!(rollback.source_deployment_id.as_deref(), Some(good.id.as_str()));
    assert_eq!(rollback.commit_hash, good.commit_hash);
    let served = std::fs::read_to_string(rollback.workspace.join("index.html"))?;
    assert_eq!(served, "v1");

    let history = deployments.list_deployments(Some("shop"), 10).await?;
    assert_eq!(history.len(), 3);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn setup() -> anyhow::Result<(TempDir, TempDir, Monoops)> {
    let home = tempdir()?;
    let projects = tempdir()?;
    std::fs::create_dir(projects.path().join("shop"))?;
    std::fs::write(projects.path().join("shop/index.html"), "v1")?;

    let monoops = Monoops::from_settings(
        Settings::builder().home_dir(home.path()).build(),
        projects.path(),
    );
    Ok((home, projects, monoops))
}

fn config() -> DeploymentConfig {
    DeploymentConfig {
        build_command: Some("mkdir -p dist && cp index.html dist/".into()),
        test_command: Some("test -f dist/index.html".into()),
        health_checks: vec![HealthCheck::Command {
            command: "test -f healthy".into(),
            timeout_secs: Some(5),
        }],
        ..Default::default()
    }
}
