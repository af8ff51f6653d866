//! Filesystem helpers shared by the pipeline, classifier and recovery.

use std::io;
use std::path::Path;

use stowage_core::item::ItemRecord;
use walkdir::WalkDir;

/// Byte and file totals of a file or folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentStats {
    pub bytes: u64,
    pub files: u64,
}

/// Walk `path` and total its regular files. Blocking.
pub fn content_stats(path: &Path) -> io::Result<ContentStats> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(ContentStats {
            bytes: meta.len(),
            files: 1,
        });
    }
    let mut stats = ContentStats::default();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            stats.bytes += entry.metadata().map_err(io::Error::from)?.len();
            stats.files += 1;
        }
    }
    Ok(stats)
}

/// Remove a file or folder. Returns `false` if nothing was there.
pub async fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}

/// Remove `path`, logging instead of failing.
pub async fn discard(path: &Path, what: &str) {
    match remove_path(path).await {
        Ok(true) => tracing::debug!(path = %path.display(), what, "Removed local artifact"),
        Ok(false) => {}
        Err(e) => tracing::warn!(path = %path.display(), what, error = %e, "Failed to remove local artifact"),
    }
}

/// Remove an item's extraction and archive, leaving the source alone.
/// Their per-item parent directories are removed once empty.
pub async fn discard_item_artifacts(item: &ItemRecord) {
    let derived = [
        (item.unpacked_path.as_deref(), "extraction"),
        (item.archive_path.as_deref(), "archive"),
    ];
    for (path, what) in derived {
        let Some(path) = path else { continue };
        if path == item.source_path {
            continue;
        }
        discard(path, what).await;
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_stats_count_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/one"), b"12345").unwrap();
        std::fs::write(dir.path().join("a/b/two"), b"678").unwrap();

        let stats = content_stats(&dir.path().join("a")).unwrap();
        assert_eq!(stats, ContentStats { bytes: 8, files: 2 });
    }

    #[tokio::test]
    async fn remove_path_handles_files_dirs_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        let sub = dir.path().join("d/e");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir_all(&sub).unwrap();

        assert!(remove_path(&file).await.unwrap());
        assert!(remove_path(&dir.path().join("d")).await.unwrap());
        assert!(!remove_path(&file).await.unwrap());
        assert!(!dir.path().join("d").exists());
    }
}
