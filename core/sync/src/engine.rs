//! Backup engine: decides per source folder whether to create, sync or skip.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use snapsync_common::{Error, Label, Result};
use snapsync_storage::{
    first_difference, BackupLock, Clock, LocalTree, RetentionReport, Snapshot, SnapshotStore,
    SystemClock, TreeOps,
};

use crate::config::{BackupConfig, BackupPolicy, OnFirstSnapshotFailure, PruneOrder};
use crate::policy::most_recent_folder;
use crate::report::{BatchReport, BatchStatus, FolderOutcome, FolderReport};

/// Runs one backup batch per call.
///
/// The engine holds no configuration of its own; every run receives the
/// `BackupConfig` explicitly. Folders are processed in order, one at a time.
pub struct SyncEngine {
    clock: Arc<dyn Clock>,
    tree: Arc<dyn TreeOps>,
}

impl SyncEngine {
    /// Create an engine using the local system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an engine with a custom time source for snapshot names.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tree: Arc::new(LocalTree),
        }
    }

    /// Perform snapshot copies, merges and removals through `tree`.
    pub fn with_tree(mut self, tree: Arc<dyn TreeOps>) -> Self {
        self.tree = tree;
        self
    }

    /// Run one batch.
    ///
    /// # Preconditions
    /// - `config.backup_base` exists and is a directory
    ///
    /// # Postconditions
    /// - Every processed label holds at most its retention cap of snapshots
    /// - The backup root lock is released
    ///
    /// # Errors
    /// - `Config` if `config.validate()` rejects the configuration
    /// - `NotFound` if the backup root is missing
    /// - `Locked` if another run holds the backup root
    ///
    /// Per-folder problems never fail the call; they are reported as
    /// `FolderOutcome::Failed`.
    pub fn run(&self, config: &BackupConfig) -> Result<BatchReport> {
        config.validate()?;
        let started = Instant::now();
        let root = config.backup_base.as_path();

        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "Backup root not found: {}",
                root.display()
            )));
        }

        let _lock = BackupLock::acquire(root)?;
        info!(
            "Starting {} backup of {} folders into {}",
            config.policy,
            config.source_folders.len(),
            root.display()
        );

        let mut folders = Vec::new();
        let mut status = BatchStatus::Completed;

        for source in self.select_sources(config) {
            let label = Label::from_path(&source);
            let store = SnapshotStore::with_clock(root, label.clone(), self.clock.clone())
                .with_tree(self.tree.clone());

            let (outcome, abort) = self.back_up(&store, &source, config);
            folders.push(FolderReport {
                source,
                label,
                outcome,
            });

            if let Some(reason) = abort {
                error!("Aborting batch: {}", reason);
                status = BatchStatus::Aborted { reason };
                break;
            }
        }

        let report = BatchReport {
            folders,
            status,
            duration: started.elapsed(),
        };
        info!(
            "Backup finished in {:?}: {} changed, {} failed",
            report.duration,
            report.changed().count(),
            report.failures().count()
        );
        Ok(report)
    }

    /// Source folders this run acts on.
    fn select_sources(&self, config: &BackupConfig) -> Vec<PathBuf> {
        match config.policy {
            BackupPolicy::MostRecent => match most_recent_folder(&config.source_folders) {
                Some(folder) => {
                    debug!("Most recently modified source: {}", folder.display());
                    vec![folder.to_path_buf()]
                }
                None => {
                    warn!("No valid source folders found");
                    Vec::new()
                }
            },
            BackupPolicy::SingleRolling | BackupPolicy::MultiVersioned => {
                config.source_folders.clone()
            }
        }
    }

    /// Back up one folder. The second value is set when the batch must stop.
    fn back_up(
        &self,
        store: &SnapshotStore,
        source: &Path,
        config: &BackupConfig,
    ) -> (FolderOutcome, Option<String>) {
        if !source.is_dir() {
            let reason = Error::NotFound(format!("Source folder not found: {}", source.display()));
            warn!("{}", reason);
            return (failed(reason), None);
        }

        if let Err(e) = store.cleanup_staging() {
            warn!("Could not clean staging for {}: {}", store.label(), e);
        }

        let latest = match store.latest() {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Could not list snapshots for {}: {}", store.label(), e);
                return (failed(e), None);
            }
        };

        let initial = latest.is_none();
        let result = match latest {
            None => self.create_initial(store, source),
            Some(latest) => match config.policy {
                BackupPolicy::SingleRolling => self.roll(store, source, latest),
                BackupPolicy::MultiVersioned | BackupPolicy::MostRecent => {
                    self.version(store, source, latest, config)
                }
            },
        };

        match result {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                warn!("Backup of {} failed: {}", source.display(), e);
                let abort = initial
                    && e.is_copy()
                    && config.on_first_snapshot_failure == OnFirstSnapshotFailure::Abort;
                let reason = abort
                    .then(|| format!("initial snapshot of {} failed: {}", source.display(), e));
                (failed(e), reason)
            }
        }
    }

    fn create_initial(&self, store: &SnapshotStore, source: &Path) -> Result<FolderOutcome> {
        info!("No existing snapshot for {}; creating one", store.label());
        let snapshot = store.create(source)?;
        Ok(FolderOutcome::Created {
            snapshot,
            initial: true,
            retention: None,
        })
    }

    /// Single rolling snapshot: merge changes into the latest one.
    fn roll(&self, store: &SnapshotStore, source: &Path, latest: Snapshot) -> Result<FolderOutcome> {
        let outcome = if changed(source, &latest)? {
            info!(
                "Changes detected in '{}'; syncing into {}",
                source.display(),
                latest.name()
            );
            let stats = store.sync_into(&latest, source)?;
            if stats.changed() {
                FolderOutcome::Synced {
                    snapshot: latest,
                    stats,
                }
            } else {
                // Only deletions differ; merging never removes extras.
                FolderOutcome::Skipped { latest }
            }
        } else {
            info!("No changes detected for '{}'; synced", source.display());
            FolderOutcome::Skipped { latest }
        };

        prune(store, 1);
        Ok(outcome)
    }

    /// Versioned snapshots: a new one per change, bounded by `max_retained`.
    fn version(
        &self,
        store: &SnapshotStore,
        source: &Path,
        latest: Snapshot,
        config: &BackupConfig,
    ) -> Result<FolderOutcome> {
        if !changed(source, &latest)? {
            info!("No changes detected for '{}'; backup skipped", source.display());
            prune(store, config.max_retained);
            return Ok(FolderOutcome::Skipped { latest });
        }

        info!("Changes detected in '{}'; creating new snapshot", source.display());
        let (snapshot, retention) = match config.prune_order {
            PruneOrder::AfterCreate => {
                let snapshot = store.create(source)?;
                (snapshot, prune(store, config.max_retained))
            }
            PruneOrder::BeforeCreate => {
                let retention = prune(store, config.max_retained.saturating_sub(1));
                (store.create(source)?, retention)
            }
        };

        Ok(FolderOutcome::Created {
            snapshot,
            initial: false,
            retention,
        })
    }
}

/// Enforce a retention cap; problems are logged, never propagated.
fn prune(store: &SnapshotStore, cap: usize) -> Option<RetentionReport> {
    match store.enforce_retention(cap) {
        Ok(report) => {
            for (snapshot, reason) in &report.failures {
                warn!("Failed to delete old snapshot {}: {}", snapshot.name(), reason);
            }
            Some(report)
        }
        Err(e) => {
            warn!("Retention for {} failed: {}", store.label(), e);
            None
        }
    }
}

/// Whether `source` differs from the snapshot's contents.
fn changed(source: &Path, snapshot: &Snapshot) -> Result<bool> {
    match first_difference(source, snapshot.path())? {
        Some(difference) => {
            debug!("{} vs {}: {}", source.display(), snapshot.name(), difference);
            Ok(true)
        }
        None => Ok(false),
    }
}

fn failed(error: Error) -> FolderOutcome {
    FolderOutcome::Failed {
        reason: error.to_string(),
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use snapsync_storage::{CopyStats, ManualClock, MergeStats};
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    struct Fixture {
        temp: TempDir,
        source: PathBuf,
        root: PathBuf,
        clock: Arc<ManualClock>,
        engine: SyncEngine,
        config: BackupConfig,
    }

    impl Fixture {
        fn run(&self) -> BatchReport {
            self.engine.run(&self.config).unwrap()
        }

        fn tick(&self) {
            self.clock.advance(Duration::minutes(1));
        }

        fn snapshots(&self, label: &str) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(&self.root)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with(&format!("backup_{}_", label)))
                .collect();
            names.sort();
            names
        }

        fn add_source(&mut self, rel: &str, file: &str, content: &str) -> PathBuf {
            let dir = self.temp.path().join(rel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(file), content).unwrap();
            self.config.add_source(&dir);
            dir
        }
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data/docs");
        let root = temp.path().join("backups");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&root).unwrap();
        fs::write(source.join("a.txt"), "x").unwrap();

        let mut config = BackupConfig::new(&root);
        config.add_source(&source);

        let clock = Arc::new(ManualClock::new(start()));
        let engine = SyncEngine::with_clock(clock.clone());
        Fixture {
            temp,
            source,
            root,
            clock,
            engine,
            config,
        }
    }

    #[test]
    fn test_first_run_creates_snapshot() {
        let f = fixture();
        let report = f.run();

        assert_eq!(report.status, BatchStatus::Completed);
        let changed = report.changed_snapshots();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0], f.root.join("backup_docs_2024-05-01_09-30-00"));
        assert_eq!(fs::read_to_string(changed[0].join("a.txt")).unwrap(), "x");
        assert!(matches!(
            report.folders[0].outcome,
            FolderOutcome::Created { initial: true, .. }
        ));
        assert!(!f.root.join(snapsync_storage::lock::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_unchanged_rerun_reports_nothing() {
        let f = fixture();
        f.run();
        f.tick();

        let report = f.run();
        assert!(report.changed_snapshots().is_empty());
        assert!(matches!(report.folders[0].outcome, FolderOutcome::Skipped { .. }));
        assert_eq!(f.snapshots("docs").len(), 1);
    }

    #[test]
    fn test_change_creates_second_snapshot() {
        let f = fixture();
        f.run();
        f.tick();
        fs::write(f.source.join("a.txt"), "y").unwrap();

        let report = f.run();
        assert_eq!(report.changed_snapshots().len(), 1);
        assert_eq!(f.snapshots("docs").len(), 2);
        assert_eq!(
            fs::read_to_string(report.changed_snapshots()[0].join("a.txt")).unwrap(),
            "y"
        );
    }

    #[test]
    fn test_retention_keeps_five_newest() {
        let f = fixture();
        f.run();

        for i in 0..6 {
            f.tick();
            fs::write(f.source.join("a.txt"), format!("v{}", i)).unwrap();
            f.run();
        }

        let names = f.snapshots("docs");
        assert_eq!(names.len(), 5);
        // The initial snapshot and the first change are gone.
        assert_eq!(names[0], "backup_docs_2024-05-01_09-32-00");
        assert_eq!(names[4], "backup_docs_2024-05-01_09-36-00");
    }

    #[test]
    fn test_before_create_with_cap_one_replaces_latest() {
        let mut f = fixture();
        f.config.prune_order = PruneOrder::BeforeCreate;
        f.config.max_retained = 1;
        f.run();
        f.tick();
        fs::write(f.source.join("a.txt"), "y").unwrap();

        let report = f.run();
        assert_eq!(f.snapshots("docs"), vec!["backup_docs_2024-05-01_09-31-00"]);
        match &report.folders[0].outcome {
            FolderOutcome::Created {
                retention: Some(retention),
                ..
            } => assert_eq!(retention.removed.len(), 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_lowered_cap_trims_on_unchanged_run() {
        let mut f = fixture();
        f.run();
        for i in 0..3 {
            f.tick();
            fs::write(f.source.join("a.txt"), format!("v{}", i)).unwrap();
            f.run();
        }
        assert_eq!(f.snapshots("docs").len(), 4);

        f.config.max_retained = 2;
        let report = f.run();
        assert!(report.changed_snapshots().is_empty());
        assert_eq!(f.snapshots("docs").len(), 2);
    }

    #[test]
    fn test_label_collision_shares_lineage() {
        let mut f = fixture();
        f.config.source_folders.clear();
        f.add_source("a/notes", "n.txt", "first");
        f.add_source("b/notes", "n.txt", "second");

        let report = f.run();
        assert_eq!(report.folders[0].label.as_str(), "notes");
        assert_eq!(report.folders[1].label.as_str(), "notes");
        assert!(matches!(
            report.folders[0].outcome,
            FolderOutcome::Created { initial: true, .. }
        ));
        assert!(matches!(
            report.folders[1].outcome,
            FolderOutcome::Created { initial: false, .. }
        ));
        assert_eq!(f.snapshots("notes").len(), 2);
    }

    #[test]
    fn test_single_rolling_merges_in_place() {
        let mut f = fixture();
        f.config.policy = BackupPolicy::SingleRolling;
        f.run();
        let name = f.snapshots("docs");

        f.tick();
        fs::write(f.source.join("a.txt"), "y").unwrap();
        fs::write(f.source.join("b.txt"), "new").unwrap();
        let report = f.run();
        assert!(matches!(report.folders[0].outcome, FolderOutcome::Synced { .. }));
        assert_eq!(f.snapshots("docs"), name);

        let snapshot = f.root.join(&name[0]);
        assert_eq!(fs::read_to_string(snapshot.join("a.txt")).unwrap(), "y");
        assert_eq!(fs::read_to_string(snapshot.join("b.txt")).unwrap(), "new");

        // Deleted source files stay in the snapshot and are not reported again.
        fs::remove_file(f.source.join("b.txt")).unwrap();
        let report = f.run();
        assert!(report.changed_snapshots().is_empty());
        assert!(snapshot.join("b.txt").exists());
    }

    #[test]
    fn test_most_recent_backs_up_newest_folder_only() {
        use std::time::{Duration as StdDuration, SystemTime};

        let mut f = fixture();
        f.config.policy = BackupPolicy::MostRecent;
        let newer = f.add_source("data/photos", "p.jpg", "img");

        let base = SystemTime::UNIX_EPOCH + StdDuration::from_secs(1_700_000_000);
        fs::File::open(&f.source).unwrap().set_modified(base).unwrap();
        fs::File::open(&newer)
            .unwrap()
            .set_modified(base + StdDuration::from_secs(10))
            .unwrap();

        let report = f.run();
        assert_eq!(report.folders.len(), 1);
        assert_eq!(report.folders[0].source, newer);
        assert_eq!(f.snapshots("photos").len(), 1);
        assert!(f.snapshots("docs").is_empty());
    }

    #[test]
    fn test_missing_source_fails_folder_only() {
        let mut f = fixture();
        f.config.source_folders.insert(0, f.temp.path().join("gone"));

        let report = f.run();
        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.folders[0].is_failed());
        assert_eq!(report.changed_snapshots().len(), 1);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let mut f = fixture();
        f.config.backup_base = f.temp.path().join("nowhere");
        let result = f.engine.run(&f.config);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_held_lock_rejects_run() {
        let f = fixture();
        let _held = BackupLock::acquire(&f.root).unwrap();
        let result = f.engine.run(&f.config);
        assert!(matches!(result, Err(Error::Locked { .. })));
    }

    #[test]
    fn test_leftover_staging_is_removed() {
        let f = fixture();
        let leftover = f
            .root
            .join(format!(".staging_docs_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(leftover.join("partial")).unwrap();

        f.run();
        assert!(!leftover.exists());
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let mut f = fixture();
        f.config.max_retained = 0;

        let result = f.engine.run(&f.config);
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(f.snapshots("docs").is_empty());
        assert!(!f.root.join(snapsync_storage::lock::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_root_inside_source_is_rejected() {
        let mut f = fixture();
        let nested = f.source.join("backups");
        fs::create_dir_all(&nested).unwrap();
        f.config.backup_base = nested.clone();

        let result = f.engine.run(&f.config);
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(fs::read_dir(&nested).unwrap().count(), 0);
    }

    /// Local tree that refuses to copy from, or remove, one path.
    #[derive(Default)]
    struct FailingTree {
        copy_from: Option<PathBuf>,
        remove: Option<PathBuf>,
    }

    impl TreeOps for FailingTree {
        fn copy(&self, src: &Path, dst: &Path) -> io::Result<CopyStats> {
            if self.copy_from.as_deref() == Some(src) {
                fs::create_dir_all(dst)?;
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
            }
            LocalTree.copy(src, dst)
        }

        fn merge(&self, src: &Path, dst: &Path) -> io::Result<MergeStats> {
            LocalTree.merge(src, dst)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            if self.remove.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
            }
            LocalTree.remove(path)
        }
    }

    impl Fixture {
        fn fail_with(&mut self, tree: FailingTree) {
            self.engine = SyncEngine::with_clock(self.clock.clone()).with_tree(Arc::new(tree));
        }

        fn no_staging_left(&self) -> bool {
            fs::read_dir(&self.root)
                .unwrap()
                .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(".staging_"))
        }
    }

    #[test]
    fn test_initial_copy_failure_aborts_batch() {
        let mut f = fixture();
        f.add_source("data/music", "m.mp3", "la");
        f.fail_with(FailingTree {
            copy_from: Some(f.source.clone()),
            ..Default::default()
        });

        let report = f.run();
        assert!(report.is_aborted());
        assert_eq!(report.folders.len(), 1);
        assert!(report.folders[0].is_failed());
        assert!(f.snapshots("docs").is_empty());
        assert!(f.snapshots("music").is_empty());
        assert!(f.no_staging_left());
    }

    #[test]
    fn test_initial_copy_failure_continues_when_configured() {
        let mut f = fixture();
        f.config.on_first_snapshot_failure = OnFirstSnapshotFailure::Continue;
        f.add_source("data/music", "m.mp3", "la");
        f.fail_with(FailingTree {
            copy_from: Some(f.source.clone()),
            ..Default::default()
        });

        let report = f.run();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.folders.len(), 2);
        assert!(report.folders[0].is_failed());
        assert_eq!(f.snapshots("music").len(), 1);
        assert!(f.snapshots("docs").is_empty());
    }

    #[test]
    fn test_copy_failure_with_prior_snapshot_only_fails_folder() {
        let mut f = fixture();
        f.run();
        f.tick();
        f.add_source("data/music", "m.mp3", "la");
        fs::write(f.source.join("a.txt"), "y").unwrap();
        f.fail_with(FailingTree {
            copy_from: Some(f.source.clone()),
            ..Default::default()
        });

        let report = f.run();
        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.folders[0].is_failed());
        assert!(matches!(
            report.folders[1].outcome,
            FolderOutcome::Created { initial: true, .. }
        ));
        assert_eq!(f.snapshots("docs").len(), 1);
        assert_eq!(f.snapshots("music").len(), 1);
        assert!(f.no_staging_left());
    }

    #[test]
    fn test_prune_failure_does_not_block_create() {
        let mut f = fixture();
        f.config.max_retained = 1;
        f.run();
        let first = f.root.join("backup_docs_2024-05-01_09-30-00");
        f.tick();
        fs::write(f.source.join("a.txt"), "y").unwrap();
        f.fail_with(FailingTree {
            remove: Some(first.clone()),
            ..Default::default()
        });

        let report = f.run();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(
            report.changed_snapshots(),
            vec![f.root.join("backup_docs_2024-05-01_09-31-00").as_path()]
        );
        match &report.folders[0].outcome {
            FolderOutcome::Created {
                retention: Some(retention),
                ..
            } => {
                assert_eq!(retention.failures.len(), 1);
                assert_eq!(retention.failures[0].0.path(), first.as_path());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(first.is_dir());
    }
}
