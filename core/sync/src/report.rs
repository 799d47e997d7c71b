//! Per-folder outcomes and batch results.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use snapsync_common::Label;
use snapsync_storage::{MergeStats, RetentionReport, Snapshot};

/// What happened to one source folder.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FolderOutcome {
    /// A new snapshot was written.
    Created {
        snapshot: Snapshot,
        /// The label had no snapshot before this one.
        initial: bool,
        /// Retention pass that accompanied the create, if any.
        retention: Option<RetentionReport>,
    },
    /// The latest snapshot was updated in place.
    Synced {
        snapshot: Snapshot,
        stats: MergeStats,
    },
    /// No change since the latest snapshot.
    Skipped { latest: Snapshot },
    /// The folder could not be backed up this run.
    Failed { reason: String },
}

/// Outcome for one source folder.
#[derive(Debug, Clone, Serialize)]
pub struct FolderReport {
    /// Source folder as configured.
    pub source: PathBuf,
    /// Label derived from the source.
    pub label: Label,
    /// What happened.
    pub outcome: FolderOutcome,
}

impl FolderReport {
    /// Snapshot written or modified for this folder, if any.
    pub fn changed_snapshot(&self) -> Option<&Snapshot> {
        match &self.outcome {
            FolderOutcome::Created { snapshot, .. } | FolderOutcome::Synced { snapshot, .. } => {
                Some(snapshot)
            }
            FolderOutcome::Skipped { .. } | FolderOutcome::Failed { .. } => None,
        }
    }

    /// Whether the folder failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, FolderOutcome::Failed { .. })
    }
}

/// Overall state of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every selected folder was processed.
    Completed,
    /// Processing stopped early.
    Aborted { reason: String },
}

/// Result of one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Per-folder outcomes in processing order.
    pub folders: Vec<FolderReport>,
    /// Whether the batch ran to the end.
    pub status: BatchStatus,
    /// Wall time of the run.
    pub duration: Duration,
}

impl BatchReport {
    /// Paths created or modified in this run, in processing order.
    ///
    /// Empty means nothing changed; the run still succeeded.
    pub fn changed_snapshots(&self) -> Vec<&Path> {
        self.changed().map(Snapshot::path).collect()
    }

    /// Snapshots created or modified in this run.
    pub fn changed(&self) -> impl Iterator<Item = &Snapshot> {
        self.folders.iter().filter_map(FolderReport::changed_snapshot)
    }

    /// Folders that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FolderReport> {
        self.folders.iter().filter(|f| f.is_failed())
    }

    /// Whether the batch was cut short.
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, BatchStatus::Aborted { .. })
    }
}
