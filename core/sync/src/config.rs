//! Persisted backup configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use snapsync_common::{Error, Result};

/// Snapshot creation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// One snapshot per label, merged in place when the source changes.
    SingleRolling,
    /// A new snapshot per change, bounded by `max_retained`.
    #[default]
    MultiVersioned,
    /// Only the most recently modified source folder, versioned.
    MostRecent,
}

impl std::str::FromStr for BackupPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "single_rolling" => Ok(Self::SingleRolling),
            "multi_versioned" => Ok(Self::MultiVersioned),
            "most_recent" => Ok(Self::MostRecent),
            other => Err(Error::InvalidInput(format!("Unknown policy: {}", other))),
        }
    }
}

impl std::fmt::Display for BackupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SingleRolling => "single_rolling",
            Self::MultiVersioned => "multi_versioned",
            Self::MostRecent => "most_recent",
        })
    }
}

/// When versioned policies retire old snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneOrder {
    /// Create the new snapshot, then trim to `max_retained`.
    #[default]
    AfterCreate,
    /// Trim to `max_retained - 1`, then create (replace-latest when the cap is 1).
    BeforeCreate,
}

/// What a failed initial snapshot does to the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFirstSnapshotFailure {
    /// Stop the batch; remaining folders are not processed.
    #[default]
    Abort,
    /// Record the failure and move on.
    Continue,
}

fn default_max_retained() -> usize {
    5
}

/// Backup configuration.
///
/// The first four fields are the original on-disk format; the rest are
/// optional so an older file still loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directories to protect.
    #[serde(default)]
    pub source_folders: Vec<PathBuf>,
    /// Directory holding the snapshots.
    #[serde(default)]
    pub backup_base: PathBuf,
    /// Remote folder id snapshots are mirrored under.
    #[serde(default)]
    pub google_parent_id: String,
    /// Whether changed snapshots are mirrored after a run.
    #[serde(default)]
    pub upload_enabled: bool,
    /// Snapshot creation strategy.
    #[serde(default)]
    pub policy: BackupPolicy,
    /// Snapshots kept per label by versioned policies.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
    /// Retention ordering for versioned policies.
    #[serde(default)]
    pub prune_order: PruneOrder,
    /// Handling of a copy failure on a label's first snapshot.
    #[serde(default)]
    pub on_first_snapshot_failure: OnFirstSnapshotFailure,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_folders: Vec::new(),
            backup_base: PathBuf::new(),
            google_parent_id: String::new(),
            upload_enabled: false,
            policy: BackupPolicy::default(),
            max_retained: default_max_retained(),
            prune_order: PruneOrder::default(),
            on_first_snapshot_failure: OnFirstSnapshotFailure::default(),
        }
    }
}

impl BackupConfig {
    /// Create a configuration with defaults for everything but the backup root.
    pub fn new(backup_base: impl Into<PathBuf>) -> Self {
        Self {
            backup_base: backup_base.into(),
            ..Default::default()
        }
    }

    /// Default location: `<config dir>/snapsync/config.json`.
    ///
    /// # Errors
    /// - `Config` if the platform has no config directory
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("snapsync").join("config.json"))
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Serialization` if it is not valid JSON for this schema
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                Error::NotFound(format!("Config file not found: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;

        let config: Self = serde_json::from_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Check the configuration is usable for a run.
    ///
    /// # Errors
    /// - `Config` naming the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.source_folders.is_empty() {
            return Err(Error::Config("No source folders configured".to_string()));
        }
        if self.backup_base.as_os_str().is_empty() {
            return Err(Error::Config("Backup folder not set".to_string()));
        }
        let base = resolve(&self.backup_base);
        if let Some(source) = self
            .source_folders
            .iter()
            .find(|source| base.starts_with(resolve(source)))
        {
            return Err(Error::Config(format!(
                "Backup folder {} is inside source folder {}",
                self.backup_base.display(),
                source.display()
            )));
        }
        if self.max_retained == 0 {
            return Err(Error::Config("max_retained must be at least 1".to_string()));
        }
        if self.upload_enabled && self.google_parent_id.trim().is_empty() {
            return Err(Error::Config(
                "Upload is enabled but google_parent_id is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Add a source folder unless already present. Returns whether it was added.
    pub fn add_source(&mut self, folder: impl Into<PathBuf>) -> bool {
        let folder = folder.into();
        if self.source_folders.contains(&folder) {
            return false;
        }
        self.source_folders.push(folder);
        true
    }

    /// Remove a source folder. Returns whether it was present.
    pub fn remove_source(&mut self, folder: &Path) -> bool {
        let before = self.source_folders.len();
        self.source_folders.retain(|f| f != folder);
        self.source_folders.len() != before
    }

    /// Retention cap the policy actually applies.
    pub fn effective_retention(&self) -> usize {
        match self.policy {
            BackupPolicy::SingleRolling => 1,
            BackupPolicy::MultiVersioned | BackupPolicy::MostRecent => self.max_retained,
        }
    }
}

/// Absolute form of `path`, following links through its deepest existing ancestor.
fn resolve(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(real) = fs::canonicalize(ancestor) {
            return match path.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
                _ => real,
            };
        }
    }
    path.to_path_buf()
}
