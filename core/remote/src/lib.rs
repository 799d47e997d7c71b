//! Remote mirror abstraction for SnapSync.
//!
//! This module provides a capability interface for pushing snapshot
//! directories to a remote object store, an in-memory implementation for
//! tests, and a Google Drive implementation.
//!
//! # Design Principles
//! - Provider isolation: no remote-specific logic in the sync engine
//! - Async operations: all remote I/O is async
//! - Flat uploads: a snapshot becomes one remote folder, nested paths are
//!   flattened into file names
//! - Unified error semantics: every provider reports `snapsync_common::Error`

pub mod gdrive;
pub mod memory;
pub mod provider;
pub mod tree;

pub use gdrive::{DriveConfig, DriveMirror};
pub use memory::MemoryMirror;
pub use provider::{RemoteFolder, RemoteMirror, UploadSummary};
pub use tree::{flatten_tree, LocalFile};
