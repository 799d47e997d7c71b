//! Remote mirror trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use snapsync_common::Result;

/// A folder on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    /// Provider-specific identifier.
    pub id: String,
    /// Display name of the folder.
    pub name: String,
}

/// Totals from uploading one local tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    /// Files uploaded (created or replaced).
    pub files: usize,
    /// Bytes sent.
    pub bytes: u64,
}

/// Remote storage capability used to mirror snapshots.
///
/// Implementations handle their own authentication and session lifecycle.
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Get the provider name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// Return the id of the folder `name` under `parent_id`, creating it if needed.
    ///
    /// # Errors
    /// - Parent folder not found
    /// - Network/authentication errors
    async fn ensure_folder(&self, name: &str, parent_id: &str) -> Result<String>;

    /// Upload every file below `local_path` into the folder `folder_id`.
    ///
    /// Nested paths are flattened: `sub/dir/file.txt` is stored as
    /// `sub_dir_file.txt`. A file that already exists under the same name is
    /// replaced rather than duplicated.
    async fn upload_tree(&self, local_path: &Path, folder_id: &str) -> Result<UploadSummary>;

    /// List the folders directly under `parent_id`.
    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>>;

    /// Delete a folder and its contents.
    async fn delete_folder(&self, folder_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_folder_serialization() {
        let folder = RemoteFolder {
            id: "abc".to_string(),
            name: "backup_docs_2024-01-01_00-00-00".to_string(),
        };

        let json = serde_json::to_string(&folder).unwrap();
        let deserialized: RemoteFolder = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, folder);
    }
}
