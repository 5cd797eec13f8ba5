use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Component, Path},
    time::UNIX_EPOCH,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::{utils, MonoopsError, MonoopsResult};

use super::{BackupConfig, BackupManifest, ManifestEntry, CHECKSUM_SIZE_LIMIT};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Compiled include and exclude patterns.
struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileFilter {
    fn new(config: &BackupConfig) -> MonoopsResult<Self> {
        let compile = |patterns: &[String]| -> MonoopsResult<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| {
                        MonoopsError::Validation(format!("invalid pattern '{}': {}", p, e))
                    })
                })
                .collect()
        };

        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
        })
    }

    /// Excluded when a pattern matches the whole relative path or any single component.
    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.iter().any(|pattern| {
            pattern.matches_with(relative, MATCH_OPTIONS)
                || relative
                    .split('/')
                    .any(|component| pattern.matches_with(component, MATCH_OPTIONS))
        })
    }

    fn is_included(&self, relative: &str) -> bool {
        self.include.iter().any(|pattern| {
            pattern.matches_with(relative, MATCH_OPTIONS)
                || pattern
                    .as_str()
                    .strip_prefix("**/")
                    .and_then(|rest| Pattern::new(rest).ok())
                    .is_some_and(|rest| rest.matches_with(relative, MATCH_OPTIONS))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Lists the files under `root` selected by `config`, sorted by path. Every entry starts out as
/// archived.
pub fn scan_files(root: &Path, config: &BackupConfig) -> MonoopsResult<Vec<ManifestEntry>> {
    let filter = FileFilter::new(config)?;
    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || relative_path(root, entry.path()).map_or(true, |rel| !filter.is_excluded(&rel))
    });

    for entry in walker {
        let entry = entry.map_err(MonoopsError::custom)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.is_included(&relative) {
            continue;
        }

        let metadata = entry.metadata().map_err(MonoopsError::custom)?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let size = metadata.len();
        let checksum = if size < CHECKSUM_SIZE_LIMIT {
            Some(utils::hash_file_blocking(entry.path())?)
        } else {
            None
        };

        files.push(ManifestEntry {
            path: relative,
            size,
            modified_ms,
            checksum,
            archived: true,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Marks as archived only the files that are new or changed relative to `parent`.
pub fn mark_changed(files: &mut [ManifestEntry], parent: &BackupManifest) {
    for file in files.iter_mut() {
        file.archived = parent
            .entry(&file.path)
            .map_or(true, |previous| file.changed_since(previous));
    }
}

/// Writes the archived entries of `files` into a gzip-compressed tar at `archive_path`.
///
/// Returns the number of uncompressed bytes written.
pub fn write_archive(
    root: &Path,
    files: &[ManifestEntry],
    archive_path: &Path,
    compression_level: u32,
) -> MonoopsResult<u64> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(compression_level.min(9)));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut bytes = 0;
    for entry in files.iter().filter(|e| e.archived) {
        builder.append_path_with_name(root.join(&entry.path), &entry.path)?;
        bytes += entry.size;
    }

    builder.into_inner()?.finish()?;
    Ok(bytes)
}

/// Extracts an archive into `target`, optionally only the entries at or below `selective` paths.
///
/// Returns the number of files written.
pub fn extract_archive(
    archive_path: &Path,
    target: &Path,
    selective: Option<&[String]>,
) -> MonoopsResult<usize> {
    std::fs::create_dir_all(target)?;
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_mtime(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        if let Some(selected) = selective {
            let wanted = selected
                .iter()
                .any(|s| path.starts_with(s.trim_start_matches("./").trim_end_matches('/')));
            if !wanted {
                continue;
            }
        }

        if entry.unpack_in(target)? && entry.header().entry_type().is_file() {
            count += 1;
        }
    }

    Ok(count)
}

/// `path` relative to `root` with `/` separators, if it is inside `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
