//! Common utilities and types shared across SnapSync modules.
//!
//! This module provides the error taxonomy and the naming types that every
//! other crate agrees on: source-folder labels and snapshot directory names.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Label, SnapshotName, TIMESTAMP_FORMAT};
