use anyhow::{Context, Error, ensure};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

/// One entry of a non-recursive directory scan.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Non-recursive listing of regular files in `directory`. A missing
/// directory yields an empty listing, matching the "nothing stored yet"
/// case for recordings and snapshots roots.
pub async fn directory_files_scan(directory: &Path) -> Result<Vec<FileInfo>, Error> {
    let mut files = Vec::new();

    let mut entries = match fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(error) => return Err(error).context("read_dir"),
    };

    while let Some(entry) = entries.next_entry().await.context("next_entry")? {
        let metadata = entry.metadata().await.context("metadata")?;
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().context("modified")?;
        let modified = DateTime::<Utc>::from(modified);

        files.push(FileInfo {
            path: entry.path(),
            size_bytes: metadata.len(),
            modified,
        });
    }

    Ok(files)
}

/// Non-recursive listing of subdirectories of `directory`.
pub async fn directory_dirs_scan(directory: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut directories = Vec::new();

    let mut entries = match fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(directories),
        Err(error) => return Err(error).context("read_dir"),
    };

    while let Some(entry) = entries.next_entry().await.context("next_entry")? {
        let metadata = entry.metadata().await.context("metadata")?;
        if metadata.is_dir() {
            directories.push(entry.path());
        }
    }

    Ok(directories)
}

// rename does not work across mount-point boundary
// this tries to move the file and if it fails, does copy + delete
pub async fn move_file(
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
) -> Result<(), Error> {
    if fs::rename(&from, &to).await.is_ok() {
        return Ok(());
    }

    fs::copy(&from, &to).await.context("copy")?;
    fs::remove_file(&from).await.context("remove_file")?;

    Ok(())
}

/// Resolves `file_name` against `root`, rejecting anything that would
/// escape it (absolute paths, parent components, separators in disguise).
pub fn path_inside_root(
    root: &Path,
    file_name: &str,
) -> Result<PathBuf, Error> {
    ensure!(!file_name.is_empty(), "empty file name");

    let relative = Path::new(file_name);
    ensure!(!relative.is_absolute(), "absolute path: {:?}", file_name);
    ensure!(
        relative
            .components()
            .all(|component| matches!(component, std::path::Component::Normal(_))),
        "path escapes root: {:?}",
        file_name
    );

    Ok(root.join(relative))
}

#[cfg(test)]
mod tests_scan {
    use super::{directory_dirs_scan, directory_files_scan};
    use crate::util::token_generate;
    use std::path::PathBuf;

    fn scratch_directory() -> PathBuf {
        std::env::temp_dir().join(format!("camera-orchestrator-test-{}", token_generate()))
    }

    #[tokio::test]
    async fn missing_directory_scans_empty() {
        let root = scratch_directory();

        assert!(directory_files_scan(&root).await.unwrap().is_empty());
        assert!(directory_dirs_scan(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scans_are_non_recursive_and_typed() {
        let root = scratch_directory();
        tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
        tokio::fs::write(root.join("a.mp4"), b"0123456789").await.unwrap();
        tokio::fs::write(root.join("sub/nested.mp4"), b"x").await.unwrap();

        let files = directory_files_scan(&root).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 10);
        assert!(files[0].path.ends_with("a.mp4"));

        let directories = directory_dirs_scan(&root).await.unwrap();
        assert_eq!(directories.len(), 1);
        assert!(directories[0].ends_with("sub"));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::path_inside_root;
    use std::path::Path;

    #[test]
    fn accepts_plain_and_nested_names() {
        let root = Path::new("/var/lib/recordings");

        assert_eq!(
            path_inside_root(root, "camera0/2025-01-01.mp4").unwrap(),
            root.join("camera0/2025-01-01.mp4")
        );
        assert_eq!(
            path_inside_root(root, "snap.jpg").unwrap(),
            root.join("snap.jpg")
        );
    }

    #[test]
    fn rejects_escapes() {
        let root = Path::new("/var/lib/recordings");

        assert!(path_inside_root(root, "").is_err());
        assert!(path_inside_root(root, "../etc/passwd").is_err());
        assert!(path_inside_root(root, "camera0/../../escape").is_err());
        assert!(path_inside_root(root, "/etc/passwd").is_err());
    }
}
