//! Google Drive implementation of `RemoteMirror`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use snapsync_common::{Error, Result};

use crate::provider::{RemoteFolder, RemoteMirror, UploadSummary};
use crate::tree::{flatten_tree, LocalFile};

use super::auth::{AuthManager, DriveCredentials, TokenManager, Tokens};
use super::client::DriveClient;

/// Files above this size go through a resumable session.
const RESUMABLE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Google Drive mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// JSON file holding the OAuth2 client configuration and tokens.
    pub credentials_path: PathBuf,
}

/// Google Drive mirror.
///
/// Each snapshot maps to one Drive folder; every file of the snapshot is
/// stored directly inside it under its flattened name.
pub struct DriveMirror {
    client: DriveClient,
    token_manager: Arc<TokenManager>,
}

impl DriveMirror {
    /// Create a mirror from a credentials file.
    ///
    /// # Preconditions
    /// - The credentials file holds tokens from a completed authorization
    ///
    /// # Errors
    /// - `NotFound` if the credentials file is missing
    /// - `Authentication` if no tokens were stored yet
    pub fn new(config: DriveConfig) -> Result<Self> {
        let credentials = DriveCredentials::load(&config.credentials_path)?;
        let tokens = credentials.tokens.clone().ok_or_else(|| {
            Error::Authentication(format!(
                "No tokens in {}; authorize first",
                config.credentials_path.display()
            ))
        })?;

        let auth_manager = AuthManager::new(credentials.auth)?;
        let token_manager = Arc::new(
            TokenManager::new(auth_manager, tokens).with_persistence(config.credentials_path),
        );
        let client = DriveClient::new(token_manager.clone())?;

        Ok(Self {
            client,
            token_manager,
        })
    }

    /// Get current tokens.
    pub async fn get_tokens(&self) -> Tokens {
        self.token_manager.get_tokens().await
    }

    async fn upload_file(
        &self,
        file: &LocalFile,
        folder_id: &str,
        existing: Option<&String>,
    ) -> Result<()> {
        if let Some(file_id) = existing {
            let data = tokio::fs::read(&file.path).await?;
            self.client.update_file(file_id, data).await?;
            tracing::debug!("Updated {} in Drive folder {}", file.remote_name, folder_id);
            return Ok(());
        }

        if file.size > RESUMABLE_THRESHOLD {
            let handle = tokio::fs::File::open(&file.path).await?;
            self.client
                .upload_resumable(
                    &file.remote_name,
                    folder_id,
                    ReaderStream::new(handle),
                    file.size,
                )
                .await?;
        } else {
            let data = tokio::fs::read(&file.path).await?;
            self.client
                .upload_simple(&file.remote_name, folder_id, data)
                .await?;
        }
        tracing::debug!("Uploaded {} to Drive folder {}", file.remote_name, folder_id);
        Ok(())
    }
}

#[async_trait]
impl RemoteMirror for DriveMirror {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn ensure_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        if let Some(existing) = self.client.find_child(name, parent_id, true).await? {
            return Ok(existing.id);
        }

        let folder = self.client.create_folder(name, parent_id).await?;
        tracing::info!("Created Drive folder {} ({})", name, folder.id);
        Ok(folder.id)
    }

    async fn upload_tree(&self, local_path: &Path, folder_id: &str) -> Result<UploadSummary> {
        let files = flatten_tree(local_path).await?;

        let existing: HashMap<String, String> = self
            .client
            .list_children(folder_id, false)
            .await?
            .into_iter()
            .filter(|f| !f.is_folder())
            .map(|f| (f.name, f.id))
            .collect();

        let mut summary = UploadSummary::default();
        for file in &files {
            self.upload_file(file, folder_id, existing.get(&file.remote_name))
                .await?;
            summary.files += 1;
            summary.bytes += file.size;
        }

        tracing::info!(
            "Uploaded {} files ({} bytes) from {}",
            summary.files,
            summary.bytes,
            local_path.display()
        );
        Ok(summary)
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>> {
        Ok(self
            .client
            .list_children(parent_id, true)
            .await?
            .into_iter()
            .map(|f| RemoteFolder {
                id: f.id,
                name: f.name,
            })
            .collect())
    }

    async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.client.delete(folder_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdrive::AuthConfig;
    use tempfile::TempDir;

    #[test]
    fn test_new_requires_credentials_file() {
        let temp = TempDir::new().unwrap();
        let result = DriveMirror::new(DriveConfig {
            credentials_path: temp.path().join("missing.json"),
        });
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_new_requires_tokens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("google_credentials.json");
        DriveCredentials {
            auth: AuthConfig::new("id", "secret"),
            tokens: None,
        }
        .save(&path)
        .unwrap();

        let result = DriveMirror::new(DriveConfig {
            credentials_path: path,
        });
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn test_new_with_tokens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("google_credentials.json");
        DriveCredentials {
            auth: AuthConfig::new("id", "secret"),
            tokens: Some(Tokens {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: chrono::Utc::now(),
            }),
        }
        .save(&path)
        .unwrap();

        let mirror = DriveMirror::new(DriveConfig {
            credentials_path: path,
        })
        .unwrap();
        assert_eq!(mirror.name(), "gdrive");
        assert_eq!(mirror.get_tokens().await.refresh_token, "refresh");
    }
}
