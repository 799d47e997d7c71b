//! Snapshot store scoped to one label under a backup root.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use snapsync_common::{Error, Label, Result, SnapshotName};

use crate::clock::{Clock, SystemClock};
use crate::tree::{LocalTree, MergeStats, TreeOps};

/// Prefix of in-progress copies; never matches the snapshot pattern.
const STAGING_PREFIX: &str = ".staging_";

/// A snapshot directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    name: SnapshotName,
    path: PathBuf,
}

impl Snapshot {
    /// Parsed directory name.
    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    /// Absolute path of the snapshot directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Serialize for Snapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Snapshot", 3)?;
        state.serialize_field("name", &self.name.to_string())?;
        state.serialize_field("label", self.name.label())?;
        state.serialize_field("path", &self.path)?;
        state.end()
    }
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    /// Snapshots still present after the pass.
    pub kept: usize,
    /// Snapshots removed, oldest first.
    pub removed: Vec<Snapshot>,
    /// Snapshots that could not be removed, with the reason.
    pub failures: Vec<(Snapshot, String)>,
}

impl RetentionReport {
    /// Whether every removal succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lists, creates, merges and retires snapshots for one label.
///
/// Only directories named `backup_<label>_<timestamp>` are ever listed or
/// deleted; everything else under the backup root is left untouched.
pub struct SnapshotStore {
    root: PathBuf,
    label: Label,
    clock: Arc<dyn Clock>,
    tree: Arc<dyn TreeOps>,
}

impl SnapshotStore {
    /// Create a store using the local system clock.
    pub fn new(root: impl AsRef<Path>, label: Label) -> Self {
        Self::with_clock(root, label, Arc::new(SystemClock))
    }

    /// Create a store with a custom time source.
    pub fn with_clock(root: impl AsRef<Path>, label: Label, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            label,
            clock,
            tree: Arc::new(LocalTree),
        }
    }

    /// Route copies, merges and removals through `tree`.
    pub fn with_tree(mut self, tree: Arc<dyn TreeOps>) -> Self {
        self.tree = tree;
        self
    }

    /// Backup root this store operates in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Label this store is scoped to.
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// All snapshots for the label, newest first.
    ///
    /// # Errors
    /// - `NotFound` if the backup root does not exist
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        if !self.root.is_dir() {
            return Err(Error::NotFound(format!(
                "Backup root not found: {}",
                self.root.display()
            )));
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(name) = SnapshotName::parse_for(&file_name, &self.label) else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            snapshots.push(Snapshot {
                name,
                path: entry.path(),
            });
        }

        snapshots.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(snapshots)
    }

    /// Most recent snapshot, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.list_snapshots()?.into_iter().next())
    }

    /// Copy `source` into a new timestamped snapshot.
    ///
    /// The tree is copied into a hidden staging directory first and renamed
    /// into place once complete, so a failed copy never leaves a directory
    /// matching the snapshot pattern.
    ///
    /// # Postconditions
    /// - The new snapshot sorts after every existing one for the label
    ///
    /// # Errors
    /// - `NotFound` if `source` is not a directory
    /// - `Copy` if the copy or the final rename fails
    pub fn create(&self, source: &Path) -> Result<Snapshot> {
        ensure_source(source)?;
        let name = self.next_name()?;
        let path = self.root.join(name.to_string());
        let staging = self
            .root
            .join(format!("{}{}_{}", STAGING_PREFIX, self.label, Uuid::new_v4()));

        debug!("Staging copy of {} in {}", source.display(), staging.display());

        let stats = match self.tree.copy(source, &staging) {
            Ok(stats) => stats,
            Err(e) => {
                self.discard_staging(&staging);
                return Err(Error::copy(&path, e));
            }
        };

        if let Err(e) = fs::rename(&staging, &path) {
            self.discard_staging(&staging);
            return Err(Error::copy(&path, e));
        }

        info!(
            "Created snapshot {} ({} files, {} bytes)",
            name, stats.files, stats.bytes
        );
        Ok(Snapshot { name, path })
    }

    /// Merge `source` into an existing snapshot without deleting extras.
    ///
    /// # Errors
    /// - `NotFound` if either side is not a directory
    /// - `Copy` if any file cannot be written
    pub fn sync_into(&self, snapshot: &Snapshot, source: &Path) -> Result<MergeStats> {
        ensure_source(source)?;
        if !snapshot.path.is_dir() {
            return Err(Error::NotFound(format!(
                "Snapshot not found: {}",
                snapshot.path.display()
            )));
        }

        let stats = self
            .tree
            .merge(source, &snapshot.path)
            .map_err(|e| Error::copy(&snapshot.path, e))?;

        info!(
            "Synced {} into {} ({} written, {} unchanged)",
            source.display(),
            snapshot.name,
            stats.files_written,
            stats.files_unchanged
        );
        Ok(stats)
    }

    /// Remove a snapshot directory.
    ///
    /// # Errors
    /// - `Delete` if removal is blocked
    pub fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        self.tree
            .remove(&snapshot.path)
            .map_err(|e| Error::delete(&snapshot.path, e))?;
        info!("Deleted snapshot {}", snapshot.name);
        Ok(())
    }

    /// Keep the `max_retained` newest snapshots and delete the rest, oldest first.
    ///
    /// Individual delete failures are collected, not returned. A cap of zero
    /// removes every snapshot for the label.
    pub fn enforce_retention(&self, max_retained: usize) -> Result<RetentionReport> {
        let snapshots = self.list_snapshots()?;
        let mut report = RetentionReport {
            kept: snapshots.len().min(max_retained),
            ..Default::default()
        };

        for snapshot in snapshots.into_iter().skip(max_retained).rev() {
            match self.delete(&snapshot) {
                Ok(()) => report.removed.push(snapshot),
                Err(e) => {
                    warn!("Retention could not remove {}: {}", snapshot.name, e);
                    report.kept += 1;
                    report.failures.push((snapshot, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Remove staging directories left behind by an interrupted `create`.
    pub fn cleanup_staging(&self) -> Result<usize> {
        let prefix = format!("{}{}_", STAGING_PREFIX, self.label);
        let mut cleaned = 0;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(rest) = file_name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            if Uuid::parse_str(rest).is_err() || !entry.file_type()?.is_dir() {
                continue;
            }

            match self.tree.remove(&entry.path()) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("Failed to remove staging {}: {}", entry.path().display(), e),
            }
        }

        if cleaned > 0 {
            info!("Removed {} leftover staging directories for {}", cleaned, self.label);
        }
        Ok(cleaned)
    }

    /// Name for a new snapshot: now, bumped past the latest and any existing entry.
    fn next_name(&self) -> Result<SnapshotName> {
        let mut name = SnapshotName::new(self.label.clone(), self.clock.now());

        if let Some(latest) = self.latest()? {
            if name <= latest.name {
                name = latest.name.next_second();
            }
        }
        while self.root.join(name.to_string()).exists() {
            name = name.next_second();
        }

        Ok(name)
    }

    fn discard_staging(&self, staging: &Path) {
        if staging.exists() {
            if let Err(e) = self.tree.remove(staging) {
                warn!("Failed to discard staging {}: {}", staging.display(), e);
            }
        }
    }
}

fn ensure_source(source: &Path) -> Result<()> {
    if source.is_dir() {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "Source folder not found: {}",
            source.display()
        )))
    }
}
