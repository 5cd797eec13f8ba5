use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tokio::fs;

use crate::{utils::PROJECT_CONFIG_DIR, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path of a per-project configuration file.
pub fn project_config_path(project_path: impl AsRef<Path>, filename: &str) -> PathBuf {
    project_path.as_ref().join(PROJECT_CONFIG_DIR).join(filename)
}

/// Reads and parses a per-project YAML configuration file, if it exists.
pub async fn load_project_config<T>(
    project_path: impl AsRef<Path>,
    filename: &str,
) -> MonoopsResult<Option<T>>
where
    T: DeserializeOwned,
{
    let path = project_config_path(project_path, filename);
    if !fs::try_exists(&path).await? {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path).await?;
    let config = serde_yaml::from_str(&contents)?;
    tracing::debug!(path = %path.display(), "loaded project config");

    Ok(Some(config))
}
