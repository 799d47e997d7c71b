//! Local snapshot storage for SnapSync.
//!
//! This module owns everything that touches the backup root on disk:
//! comparing directory trees, copying and merging them, naming and rotating
//! snapshots, and the advisory lock that keeps two runs from interleaving.
//!
//! # Design Principles
//! - Blocking I/O: every operation runs to completion on the calling thread
//! - Worklist traversal: tree walks never recurse, so depth is bounded by memory only
//! - Naming contract: only `backup_<label>_<timestamp>` directories are ever touched

pub mod clock;
pub mod comparator;
pub mod lock;
pub mod store;
pub mod tree;

pub use clock::{Clock, ManualClock, SystemClock};
pub use comparator::{differs, first_difference, Difference};
pub use lock::BackupLock;
pub use store::{RetentionReport, Snapshot, SnapshotStore};
pub use tree::{CopyStats, LocalTree, MergeStats, TreeOps};
