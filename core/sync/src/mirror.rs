//! Pushing changed snapshots to a remote mirror.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use snapsync_common::{Label, Result, SnapshotName};
use snapsync_remote::{RemoteMirror, UploadSummary};
use snapsync_storage::Snapshot;

use crate::config::BackupConfig;
use crate::report::BatchReport;
use crate::retry::RetryExecutor;

/// One snapshot that reached the remote side.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    /// Snapshot directory name (also the remote folder name).
    pub snapshot: String,
    /// Id of the remote folder.
    pub folder_id: String,
    /// Files and bytes sent.
    pub summary: UploadSummary,
}

/// Result of mirroring a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorReport {
    /// Snapshots uploaded.
    pub uploaded: Vec<Upload>,
    /// Remote folders deleted by retention.
    pub pruned: Vec<String>,
    /// Local snapshot path (or remote folder) and the error that stopped it.
    pub failures: Vec<(PathBuf, String)>,
}

impl MirrorReport {
    /// Whether everything succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Uploads snapshots and applies the retention cap to the remote parent folder.
///
/// Remote failures are collected; local snapshots are never touched.
pub struct MirrorPublisher<M: RemoteMirror + ?Sized> {
    mirror: Arc<M>,
    parent_id: String,
    retry: RetryExecutor,
}

impl<M: RemoteMirror + ?Sized> MirrorPublisher<M> {
    /// Create a publisher writing under `parent_id`.
    pub fn new(mirror: Arc<M>, parent_id: impl Into<String>) -> Self {
        Self {
            mirror,
            parent_id: parent_id.into(),
            retry: RetryExecutor::default(),
        }
    }

    /// Use a custom retry executor.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Upload one snapshot into a folder named after it.
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<Upload> {
        let name = snapshot.name().to_string();

        let folder_id = self
            .retry
            .execute("ensure remote folder", || {
                self.mirror.ensure_folder(&name, &self.parent_id)
            })
            .await?;

        let summary = self
            .retry
            .execute("upload snapshot", || {
                self.mirror.upload_tree(snapshot.path(), &folder_id)
            })
            .await?;

        info!(
            "Uploaded {} to {} ({} files)",
            name,
            self.mirror.name(),
            summary.files
        );
        Ok(Upload {
            snapshot: name,
            folder_id,
            summary,
        })
    }

    /// Delete remote snapshot folders for `label` beyond the newest `keep`.
    ///
    /// Folders whose names do not parse as snapshots of the label are left alone.
    /// Returns the deleted folder names.
    pub async fn prune(&self, label: &Label, keep: usize) -> Result<Vec<String>> {
        let folders = self
            .retry
            .execute("list remote folders", || {
                self.mirror.list_folders(&self.parent_id)
            })
            .await?;

        let mut snapshots: Vec<(SnapshotName, String)> = folders
            .into_iter()
            .filter_map(|f| SnapshotName::parse_for(&f.name, label).map(|name| (name, f.id)))
            .collect();
        snapshots.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = Vec::new();
        for (name, id) in snapshots.into_iter().skip(keep).rev() {
            self.retry
                .execute("delete remote folder", || self.mirror.delete_folder(&id))
                .await?;
            info!("Deleted remote snapshot {}", name);
            removed.push(name.to_string());
        }
        Ok(removed)
    }

    /// Upload every snapshot a batch changed, then prune each touched label.
    pub async fn mirror_batch(&self, batch: &BatchReport, config: &BackupConfig) -> MirrorReport {
        let mut report = MirrorReport::default();
        let mut labels: Vec<&Label> = Vec::new();

        for snapshot in batch.changed() {
            match self.publish(snapshot).await {
                Ok(upload) => report.uploaded.push(upload),
                Err(e) => {
                    warn!("Upload of {} failed: {}", snapshot.name(), e);
                    report
                        .failures
                        .push((snapshot.path().to_path_buf(), e.to_string()));
                }
            }
            if !labels.contains(&snapshot.name().label()) {
                labels.push(snapshot.name().label());
            }
        }

        let keep = config.effective_retention();
        for label in labels {
            match self.prune(label, keep).await {
                Ok(removed) => report.pruned.extend(removed),
                Err(e) => {
                    warn!("Remote retention for {} failed: {}", label, e);
                    report
                        .failures
                        .push((PathBuf::from(label.as_str()), e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncEngine;
    use crate::retry::RetryConfig;
    use chrono::{Duration, NaiveDate};
    use snapsync_remote::memory::MEMORY_ROOT_ID;
    use snapsync_remote::MemoryMirror;
    use snapsync_storage::ManualClock;
    use std::fs;
    use tempfile::TempDir;

    fn no_retry() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(0)
                .with_initial_delay(std::time::Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        clock: Arc<ManualClock>,
        engine: SyncEngine,
        config: BackupConfig,
        mirror: Arc<MemoryMirror>,
        publisher: MirrorPublisher<MemoryMirror>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data/docs");
        let root = temp.path().join("backups");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::create_dir_all(&root).unwrap();
        fs::write(source.join("a.txt"), "x").unwrap();
        fs::write(source.join("sub/b.txt"), "yy").unwrap();

        let mut config = BackupConfig::new(&root);
        config.add_source(&source);
        config.upload_enabled = true;
        config.google_parent_id = MEMORY_ROOT_ID.to_string();
        config.max_retained = 2;

        let start = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let mirror = Arc::new(MemoryMirror::new());
        let publisher = MirrorPublisher::new(mirror.clone(), MEMORY_ROOT_ID).with_retry(no_retry());

        Fixture {
            _temp: temp,
            source,
            engine: SyncEngine::with_clock(clock.clone()),
            clock,
            config,
            mirror,
            publisher,
        }
    }

    #[tokio::test]
    async fn test_mirror_batch_uploads_flattened_tree() {
        let f = fixture();
        let batch = f.engine.run(&f.config).unwrap();

        let report = f.publisher.mirror_batch(&batch, &f.config).await;
        assert!(report.is_clean());
        assert_eq!(report.uploaded.len(), 1);

        let upload = &report.uploaded[0];
        assert_eq!(upload.snapshot, "backup_docs_2024-05-01_09-30-00");
        assert_eq!(upload.summary.files, 2);
        assert_eq!(f.mirror.file(&upload.folder_id, "sub_b.txt"), Some(b"yy".to_vec()));
    }

    #[tokio::test]
    async fn test_unchanged_batch_uploads_nothing() {
        let f = fixture();
        f.engine.run(&f.config).unwrap();
        f.clock.advance(Duration::minutes(1));
        let batch = f.engine.run(&f.config).unwrap();

        let report = f.publisher.mirror_batch(&batch, &f.config).await;
        assert!(report.uploaded.is_empty());
        assert!(f.mirror.folder_names(MEMORY_ROOT_ID).is_empty());
    }

    #[tokio::test]
    async fn test_remote_retention_keeps_newest() {
        let f = fixture();
        for i in 0..4 {
            fs::write(f.source.join("a.txt"), format!("v{}", i)).unwrap();
            let batch = f.engine.run(&f.config).unwrap();
            f.publisher.mirror_batch(&batch, &f.config).await;
            f.clock.advance(Duration::minutes(1));
        }

        assert_eq!(
            f.mirror.folder_names(MEMORY_ROOT_ID),
            vec![
                "backup_docs_2024-05-01_09-32-00",
                "backup_docs_2024-05-01_09-33-00"
            ]
        );
    }

    #[tokio::test]
    async fn test_prune_ignores_foreign_folders() {
        let f = fixture();
        for name in [
            "backup_docs_2024-01-01_00-00-00",
            "backup_docs_2024-02-01_00-00-00",
            "backup_notes_2024-01-01_00-00-00",
            "Photos",
        ] {
            f.mirror.ensure_folder(name, MEMORY_ROOT_ID).await.unwrap();
        }

        let removed = f
            .publisher
            .prune(&Label::sanitize("docs"), 1)
            .await
            .unwrap();
        assert_eq!(removed, vec!["backup_docs_2024-01-01_00-00-00"]);
        assert_eq!(
            f.mirror.folder_names(MEMORY_ROOT_ID),
            vec![
                "Photos",
                "backup_docs_2024-02-01_00-00-00",
                "backup_notes_2024-01-01_00-00-00"
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_mirror_collects_failures() {
        let f = fixture();
        let batch = f.engine.run(&f.config).unwrap();
        f.mirror.set_offline(true);

        let report = f.publisher.mirror_batch(&batch, &f.config).await;
        assert!(!report.is_clean());
        assert!(report.uploaded.is_empty());
        // One failed upload plus one failed retention pass.
        assert_eq!(report.failures.len(), 2);
        assert_eq!(batch.changed_snapshots().len(), 1);
        assert!(batch.changed_snapshots()[0].exists());
    }
}
