//! SnapSync backup engine
//!
//! This crate turns a `BackupConfig` into snapshots on disk and, optionally,
//! mirrors them to a remote store:
//! - Three policies: single rolling, multi versioned, most recent
//! - Retention per label, before or after creating the new snapshot
//! - Per-folder outcomes collected into a batch report
//! - Remote publishing with retry and remote retention
//! - On-demand and periodic scheduling
//! - Run history for status reporting

pub mod config;
pub mod engine;
pub mod mirror;
pub mod policy;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use config::{BackupConfig, BackupPolicy, OnFirstSnapshotFailure, PruneOrder};
pub use engine::SyncEngine;
pub use mirror::{MirrorPublisher, MirrorReport, Upload};
pub use policy::most_recent_folder;
pub use report::{BatchReport, BatchStatus, FolderOutcome, FolderReport};
pub use retry::{is_transient, RetryConfig, RetryExecutor};
pub use scheduler::{BackupScheduler, ScheduleMode, SchedulerHandle, Trigger};
pub use state::{RunHistory, RunRecord, RunStatus};
