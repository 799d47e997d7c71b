//! In-memory remote mirror for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use snapsync_common::{Error, Result};

use crate::provider::{RemoteFolder, RemoteMirror, UploadSummary};
use crate::tree::flatten_tree;

/// Id of the folder every `MemoryMirror` starts with.
pub const MEMORY_ROOT_ID: &str = "root";

/// In-memory folder.
#[derive(Debug, Clone)]
struct Folder {
    name: String,
    parent: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

/// In-memory remote mirror.
///
/// Useful for testing and development. All data is stored in memory and lost
/// on drop. Can be switched offline to simulate network failures.
#[derive(Clone)]
pub struct MemoryMirror {
    folders: Arc<RwLock<HashMap<String, Folder>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryMirror {
    /// Create a mirror holding only the root folder.
    pub fn new() -> Self {
        let mut folders = HashMap::new();
        folders.insert(
            MEMORY_ROOT_ID.to_string(),
            Folder {
                name: "/".to_string(),
                parent: None,
                files: BTreeMap::new(),
            },
        );

        Self {
            folders: Arc::new(RwLock::new(folders)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent call fail with a network error (or recover).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Names of the folders under `parent_id`, sorted.
    pub fn folder_names(&self, parent_id: &str) -> Vec<String> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = folders
            .values()
            .filter(|f| f.parent.as_deref() == Some(parent_id))
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Content of a file stored in a folder.
    pub fn file(&self, folder_id: &str, name: &str) -> Option<Vec<u8>> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders.get(folder_id)?.files.get(name).cloned()
    }

    /// Number of files stored in a folder.
    pub fn file_count(&self, folder_id: &str) -> usize {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders.get(folder_id).map(|f| f.files.len()).unwrap_or(0)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Network("Memory mirror is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteMirror for MemoryMirror {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        self.check_online()?;
        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());

        if !folders.contains_key(parent_id) {
            return Err(Error::NotFound(format!("Parent folder not found: {}", parent_id)));
        }

        if let Some((id, _)) = folders
            .iter()
            .find(|(_, f)| f.name == name && f.parent.as_deref() == Some(parent_id))
        {
            return Ok(id.clone());
        }

        let id = Uuid::new_v4().to_string();
        folders.insert(
            id.clone(),
            Folder {
                name: name.to_string(),
                parent: Some(parent_id.to_string()),
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_tree(&self, local_path: &Path, folder_id: &str) -> Result<UploadSummary> {
        self.check_online()?;
        let files = flatten_tree(local_path).await?;

        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let data = tokio::fs::read(&file.path).await?;
            staged.push((file.remote_name, data));
        }

        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
        let folder = folders
            .get_mut(folder_id)
            .ok_or_else(|| Error::NotFound(format!("Folder not found: {}", folder_id)))?;

        let mut summary = UploadSummary::default();
        for (name, data) in staged {
            summary.files += 1;
            summary.bytes += data.len() as u64;
            folder.files.insert(name, data);
        }
        Ok(summary)
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>> {
        self.check_online()?;
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());

        if !folders.contains_key(parent_id) {
            return Err(Error::NotFound(format!("Parent folder not found: {}", parent_id)));
        }

        Ok(folders
            .iter()
            .filter(|(_, f)| f.parent.as_deref() == Some(parent_id))
            .map(|(id, f)| RemoteFolder {
                id: id.clone(),
                name: f.name.clone(),
            })
            .collect())
    }

    async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.check_online()?;
        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());

        if folder_id == MEMORY_ROOT_ID {
            return Err(Error::PermissionDenied("Cannot delete root folder".to_string()));
        }

        folders
            .remove(folder_id)
            .ok_or_else(|| Error::NotFound(format!("Folder not found: {}", folder_id)))?;

        // Drop descendants so nothing dangles.
        let mut orphans = vec![folder_id.to_string()];
        while let Some(parent) = orphans.pop() {
            let children: Vec<String> = folders
                .iter()
                .filter(|(_, f)| f.parent.as_deref() == Some(parent.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            for child in children {
                folders.remove(&child);
                orphans.push(child);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_folder_is_idempotent() {
        let mirror = MemoryMirror::new();
        let first = mirror.ensure_folder("backup_docs", MEMORY_ROOT_ID).await.unwrap();
        let second = mirror.ensure_folder("backup_docs", MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mirror.folder_names(MEMORY_ROOT_ID), vec!["backup_docs"]);
    }

    #[tokio::test]
    async fn test_ensure_folder_unknown_parent() {
        let mirror = MemoryMirror::new();
        let result = mirror.ensure_folder("x", "missing").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upload_tree_replaces_same_names() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();
        std::fs::write(temp.path().join("sub/b.txt"), "yy").unwrap();

        let mirror = MemoryMirror::new();
        let folder = mirror.ensure_folder("snap", MEMORY_ROOT_ID).await.unwrap();

        let summary = mirror.upload_tree(temp.path(), &folder).await.unwrap();
        assert_eq!(summary, UploadSummary { files: 2, bytes: 3 });

        std::fs::write(temp.path().join("a.txt"), "changed").unwrap();
        mirror.upload_tree(temp.path(), &folder).await.unwrap();

        assert_eq!(mirror.file_count(&folder), 2);
        assert_eq!(mirror.file(&folder, "a.txt"), Some(b"changed".to_vec()));
        assert_eq!(mirror.file(&folder, "sub_b.txt"), Some(b"yy".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_folder_and_offline() {
        let mirror = MemoryMirror::new();
        let folder = mirror.ensure_folder("snap", MEMORY_ROOT_ID).await.unwrap();
        mirror.ensure_folder("nested", &folder).await.unwrap();

        mirror.delete_folder(&folder).await.unwrap();
        assert!(mirror.list_folders(MEMORY_ROOT_ID).await.unwrap().is_empty());

        mirror.set_offline(true);
        let result = mirror.list_folders(MEMORY_ROOT_ID).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
