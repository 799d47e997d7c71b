//! Run history: what the last backup did and when.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use snapsync_common::{Error, Result};

use crate::mirror::MirrorReport;
use crate::report::{BatchReport, BatchStatus, FolderOutcome};

/// Runs remembered in the history file.
const MAX_ENTRIES: usize = 20;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Local backup succeeded and, if enabled, so did the upload.
    Succeeded,
    /// Local backup succeeded but some folders or uploads failed.
    Partial,
    /// The batch was aborted or could not start.
    Failed,
}

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// When the run finished.
    pub finished_at: DateTime<Local>,
    /// Overall status.
    pub status: RunStatus,
    /// Snapshot paths created or modified.
    pub changed: Vec<PathBuf>,
    /// Snapshots uploaded to the remote mirror.
    #[serde(default)]
    pub uploaded: usize,
    /// Human-readable problems, one per failure.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RunRecord {
    /// Summarize a finished batch and its optional mirror pass.
    pub fn from_reports(batch: &BatchReport, mirror: Option<&MirrorReport>) -> Self {
        let mut errors: Vec<String> = batch
            .failures()
            .filter_map(|f| match &f.outcome {
                FolderOutcome::Failed { reason } => {
                    Some(format!("{}: {}", f.source.display(), reason))
                }
                _ => None,
            })
            .collect();

        if let BatchStatus::Aborted { reason } = &batch.status {
            errors.push(format!("aborted: {}", reason));
        }
        if let Some(mirror) = mirror {
            errors.extend(
                mirror
                    .failures
                    .iter()
                    .map(|(path, reason)| format!("upload {}: {}", path.display(), reason)),
            );
        }

        let status = if batch.is_aborted() {
            RunStatus::Failed
        } else if errors.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::Partial
        };

        Self {
            finished_at: Local::now(),
            status,
            changed: batch
                .changed_snapshots()
                .into_iter()
                .map(Path::to_path_buf)
                .collect(),
            uploaded: mirror.map(|m| m.uploaded.len()).unwrap_or(0),
            errors,
        }
    }

    /// Record a run that failed before any folder was processed.
    pub fn failed(error: &Error) -> Self {
        Self {
            finished_at: Local::now(),
            status: RunStatus::Failed,
            changed: Vec::new(),
            uploaded: 0,
            errors: vec![error.to_string()],
        }
    }
}

/// Recent runs, newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    runs: Vec<RunRecord>,
}

impl RunHistory {
    /// History file kept next to a config file.
    pub fn path_for(config_path: &Path) -> PathBuf {
        config_path.with_file_name("history.json")
    }

    /// Load history; a missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write history, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Append a run, dropping the oldest beyond the cap.
    pub fn record(&mut self, run: RunRecord) {
        self.runs.push(run);
        if self.runs.len() > MAX_ENTRIES {
            let excess = self.runs.len() - MAX_ENTRIES;
            self.runs.drain(..excess);
        }
    }

    /// Most recent run.
    pub fn last(&self) -> Option<&RunRecord> {
        self.runs.last()
    }

    /// Most recent run that did not fail outright.
    pub fn last_success(&self) -> Option<&RunRecord> {
        self.runs
            .iter()
            .rev()
            .find(|r| r.status != RunStatus::Failed)
    }

    /// All remembered runs, oldest first.
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FolderReport;
    use snapsync_common::Label;
    use std::time::Duration;
    use tempfile::TempDir;

    fn batch(status: BatchStatus, failed: bool) -> BatchReport {
        let folders = if failed {
            vec![FolderReport {
                source: PathBuf::from("/data/gone"),
                label: Label::sanitize("gone"),
                outcome: FolderOutcome::Failed {
                    reason: "Not found: /data/gone".to_string(),
                },
            }]
        } else {
            Vec::new()
        };
        BatchReport {
            folders,
            status,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_status_from_reports() {
        let ok = RunRecord::from_reports(&batch(BatchStatus::Completed, false), None);
        assert_eq!(ok.status, RunStatus::Succeeded);
        assert!(ok.errors.is_empty());

        let partial = RunRecord::from_reports(&batch(BatchStatus::Completed, true), None);
        assert_eq!(partial.status, RunStatus::Partial);
        assert_eq!(partial.errors.len(), 1);

        let aborted = batch(
            BatchStatus::Aborted {
                reason: "copy failed".to_string(),
            },
            true,
        );
        let failed = RunRecord::from_reports(&aborted, None);
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.errors.len(), 2);

        let mirror = MirrorReport {
            failures: vec![(PathBuf::from("/backups/x"), "offline".to_string())],
            ..Default::default()
        };
        let upload_failed =
            RunRecord::from_reports(&batch(BatchStatus::Completed, false), Some(&mirror));
        assert_eq!(upload_failed.status, RunStatus::Partial);
    }

    #[test]
    fn test_history_persists_and_caps() {
        let temp = TempDir::new().unwrap();
        let path = RunHistory::path_for(&temp.path().join("snapsync/config.json"));
        assert_eq!(path, temp.path().join("snapsync/history.json"));

        let mut history = RunHistory::load(&path).unwrap();
        assert!(history.last().is_none());

        for _ in 0..MAX_ENTRIES + 3 {
            history.record(RunRecord::from_reports(&batch(BatchStatus::Completed, false), None));
        }
        history.record(RunRecord::failed(&Error::NotFound("root".to_string())));
        history.save(&path).unwrap();

        let loaded = RunHistory::load(&path).unwrap();
        assert_eq!(loaded.runs().len(), MAX_ENTRIES);
        assert_eq!(loaded.last().unwrap().status, RunStatus::Failed);
        assert_eq!(loaded.last_success().unwrap().status, RunStatus::Succeeded);
    }

    #[test]
    fn test_corrupt_history_is_an_error() {
        assert!(matches!(
            RunHistory::from_json("[oops"),
            Err(Error::Serialization(_))
        ));
    }
}
