use std::{collections::BTreeMap, path::Path, sync::Arc};

use monoops::{
    backup::{extract_archive, BackupCoordinator, BackupManifest, BackupStatus, BackupType},
    config::Settings,
    registry::{LocalRegistry, MemoryAuditStore},
    utils::{self, ARCHIVE_FILENAME, MANIFEST_FILENAME},
};
use tempfile::{tempdir, TempDir};
use walkdir::WalkDir;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_full_backup_round_trip_is_byte_identical() -> anyhow::Result<()> {
    let (home, projects, coordinator) = setup()?;
    let project = projects.path().join("shop");
    write(&project, "index.html", "<h1>shop</h1>")?;
    write(&project, "src/app.js", "console.log('hi')")?;
    write(&project, "assets/logo.bin", &"\u{1}\u{2}".repeat(4096))?;

    let backup = coordinator.backup_project("shop", false, vec![]).await?;
    assert_eq!(backup.status, BackupStatus::Completed, "{:?}", backup.error);
    assert_eq!(backup.backup_type, BackupType::Full);
    assert!(backup.path.starts_with(home.path()));

    let target = tempdir()?;
    let outcome = coordinator
        .restore_project(&backup.id, target.path(), None)
        .await?;
    assert_eq!(outcome.chain, vec![backup.id.clone()]);
    assert_eq!(outcome.files_restored, 3);
    assert_eq!(tree(target.path())?, tree(&project)?);

    let manifest = manifest(&backup.path)?;
    for entry in &manifest.files {
        let restored = utils::hash_file_blocking(&target.path().join(&entry.path))?;
        assert_eq!(entry.checksum.as_deref(), Some(restored.as_str()), "{}", entry.path);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_incremental_carries_only_changed_and_new_files() -> anyhow::Result<()> {
    let (_home, projects, coordinator) = setup()?;
    let project = projects.path().join("shop");
    write(&project, "a.txt", "unchanged")?;
    write(&project, "b.txt", "before")?;

    let base = coordinator.backup_project("shop", false, vec![]).await?;

    write(&project, "b.txt", "after, and longer")?;
    write(&project, "c.txt", "new")?;
    let incremental = coordinator.backup_project("shop", true, vec![]).await?;

    assert_eq!(incremental.backup_type, BackupType::Incremental);
    assert_eq!(incremental.parent_backup_id.as_deref(), Some(base.id.as_str()));
    assert_eq!(incremental.file_count, 2);

    let manifest = manifest(&incremental.path)?;
    let archived: Vec<_> = manifest.archived().map(|e| e.path.as_str()).collect();
    assert_eq!(archived, vec!["b.txt", "c.txt"]);
    assert!(manifest.entry("a.txt").is_some_and(|e| !e.archived));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_chain_restore_matches_manual_replay() -> anyhow::Result<()> {
    let (_home, projects, coordinator) = setup()?;
    let project = projects.path().join("shop");
    write(&project, "a.txt", "a0")?;
    write(&project, "b.txt", "b0")?;
    let b0 = coordinator.backup_project("shop", false, vec![]).await?;

    write(&project, "b.txt", "b1 changed")?;
    write(&project, "c.txt", "c1")?;
    let b1 = coordinator.backup_project("shop", true, vec![]).await?;

    write(&project, "a.txt", "a2 changed again")?;
    write(&project, "nested/d.txt", "d2")?;
    let b2 = coordinator.backup_project("shop", true, vec![]).await?;
    assert_eq!(b2.parent_backup_id.as_deref(), Some(b1.id.as_str()));

    let restored = tempdir()?;
    let outcome = coordinator
        .restore_project(&b2.id, restored.path(), None)
        .await?;
    assert_eq!(outcome.chain, vec![b0.id.clone(), b1.id.clone(), b2.id.clone()]);

    let replayed = tempdir()?;
    for backup in [&b0, &b1, &b2] {
        extract_archive(&backup.path.join(ARCHIVE_FILENAME), replayed.path(), None)?;
    }

    assert_eq!(tree(restored.path())?, tree(replayed.path())?);
    assert_eq!(tree(restored.path())?, tree(&project)?);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_selective_restore_limits_paths() -> anyhow::Result<()> {
    let (_home, projects, coordinator) = setup()?;
    let project = projects.path().join("shop");
    write(&project, "config/app.yaml", "port: 1")?;
    write(&project, "src/main.py", "print()")?;
    let backup = coordinator.backup_project("shop", false, vec![]).await?;

    let target = tempdir()?;
    let outcome = coordinator
        .restore_project(&backup.id, target.path(), Some(vec!["config".into()]))
        .await?;

    assert_eq!(outcome.files_restored, 1);
    assert!(target.path().join("config/app.yaml").exists());
    assert!(!target.path().join("src/main.py").exists());
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn setup() -> anyhow::Result<(TempDir, TempDir, BackupCoordinator)> {
    let home = tempdir()?;
    let projects = tempdir()?;
    std::fs::create_dir(projects.path().join("shop"))?;

    let coordinator = BackupCoordinator::new(
        Settings::builder().home_dir(home.path()).build(),
        Arc::new(LocalRegistry::with_root(projects.path())),
        Arc::new(MemoryAuditStore::new()),
    );
    Ok((home, projects, coordinator))
}

fn write(root: &Path, relative: &str, contents: &str) -> anyhow::Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

fn manifest(backup_dir: &Path) -> anyhow::Result<BackupManifest> {
    Ok(serde_json::from_slice(&std::fs::read(
        backup_dir.join(MANIFEST_FILENAME),
    )?)?)
}

/// Every file under `root` keyed by relative path.
fn tree(root: &Path) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            files.insert(relative, std::fs::read(entry.path())?);
        }
    }
    Ok(files)
}
