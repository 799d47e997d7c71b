//! Enumerating a local snapshot for upload.

use std::path::{Path, PathBuf};
use tokio::fs;

use snapsync_common::{Error, Result};

/// A local file queued for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Flattened name used on the remote side.
    pub remote_name: String,
    /// Size in bytes.
    pub size: u64,
}

/// List every file below `root`, flattening relative paths with `_`.
///
/// Linked directories are not descended into. The result is sorted by
/// remote name.
pub async fn flatten_tree(root: &Path) -> Result<Vec<LocalFile>> {
    if !fs::metadata(root).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(Error::NotFound(format!(
            "Directory not found: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];

    while let Some(rel) = pending.pop() {
        let mut entries = fs::read_dir(root.join(&rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let rel_path = rel.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push(rel_path);
                continue;
            }

            let meta = match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            files.push(LocalFile {
                path: entry.path(),
                remote_name: flatten_name(&rel_path),
                size: meta.len(),
            });
        }
    }

    files.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
    Ok(files)
}

fn flatten_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flatten_nested_paths() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("sub/dir")).unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();
        std::fs::write(temp.path().join("sub/dir/file.txt"), "hello").unwrap();

        let files = flatten_tree(temp.path()).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.remote_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub_dir_file.txt"]);
        assert_eq!(files[1].size, 5);
    }

    #[tokio::test]
    async fn test_flatten_missing_root() {
        let temp = TempDir::new().unwrap();
        let result = flatten_tree(&temp.path().join("missing")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
