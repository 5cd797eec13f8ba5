use std::{
    io::Read,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tokio::fs;
use walkdir::WalkDir;

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Gets the hex-encoded SHA-256 hash of a file.
pub async fn get_file_hash(path: impl AsRef<Path>) -> MonoopsResult<String> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path)).await?
}

/// Streams a file through SHA-256 without loading it into memory.
pub fn hash_file_blocking(path: &Path) -> MonoopsResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Gets the hex-encoded SHA-256 hash of a byte slice.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Copies a directory tree, skipping any entry whose file name is in `excluded`.
///
/// Returns the number of files copied.
pub async fn copy_dir_filtered(
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    excluded: &[&str],
) -> MonoopsResult<usize> {
    let source = source.as_ref().to_path_buf();
    let destination = destination.as_ref().to_path_buf();
    let excluded: Vec<String> = excluded.iter().map(|s| s.to_string()).collect();

    tokio::task::spawn_blocking(move || -> MonoopsResult<usize> {
        let mut copied = 0;
        let walker = WalkDir::new(&source).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !excluded
                    .iter()
                    .any(|name| entry.file_name().to_string_lossy() == name.as_str())
        });

        for entry in walker {
            let entry = entry.map_err(MonoopsError::custom)?;
            let relative = entry
                .path()
                .strip_prefix(&source)
                .map_err(MonoopsError::custom)?;
            let target = destination.join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }

        Ok(copied)
    })
    .await?
}

/// Writes `contents` to `path`, first renaming any existing file to `<name>.<suffix>`.
///
/// Returns the backup path if a previous file existed.
pub async fn write_with_backup(
    path: impl AsRef<Path>,
    contents: impl AsRef<[u8]>,
    suffix: &str,
) -> MonoopsResult<Option<PathBuf>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let backup = if fs::try_exists(path).await? {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let backup_path = path.with_file_name(format!("{}.{}", file_name, suffix));
        fs::copy(path, &backup_path).await?;
        Some(backup_path)
    } else {
        None
    };

    fs::write(path, contents).await?;
    Ok(backup)
}

/// Returns the last `lines` lines of a text file, or an empty list if it does not exist.
pub async fn tail_file(path: impl AsRef<Path>, lines: usize) -> MonoopsResult<Vec<String>> {
    let path = path.as_ref();
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }

    let contents = fs::read(path).await?;
    let text = String::from_utf8_lossy(&contents);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_dir_filtered_skips_excluded() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        std::fs::create_dir_all(src.path().join(".git"))?;
        std::fs::write(src.path().join(".git/HEAD"), "ref")?;
        std::fs::create_dir_all(src.path().join("node_modules/x"))?;
        std::fs::write(src.path().join("node_modules/x/index.js"), "x")?;
        std::fs::create_dir_all(src.path().join("src"))?;
        std::fs::write(src.path().join("src/main.js"), "main")?;

        let copied = copy_dir_filtered(src.path(), dst.path(), &[".git", "node_modules"]).await?;

        assert_eq!(copied, 1);
        assert!(dst.path().join("src/main.js").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("node_modules").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_with_backup_keeps_previous() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".env");

        assert!(write_with_backup(&path, "A=1\n", "bak").await?.is_none());
        let backup = write_with_backup(&path, "A=2\n", "bak").await?.unwrap();

        assert_eq!(std::fs::read_to_string(&backup)?, "A=1\n");
        assert_eq!(std::fs::read_to_string(&path)?, "A=2\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_tail_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.log");
        std::fs::write(&path, "a\nb\nc\nd\n")?;

        assert_eq!(tail_file(&path, 2).await?, vec!["c", "d"]);
        assert_eq!(tail_file(&path, 10).await?.len(), 4);
        assert!(tail_file(dir.path().join("missing"), 3).await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_hash_bytes_matches_file_hash() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello")?;
        assert_eq!(hash_file_blocking(&path)?, hash_bytes(b"hello"));
        Ok(())
    }
}
