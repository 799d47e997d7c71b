//! Recursive directory comparison.

use std::fmt;
use std::path::{Path, PathBuf};

use snapsync_common::{Error, Result};

use crate::tree::{read_entries, same_content, EntryKind};

/// First difference found between two trees, as a path relative to both roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    /// Present only in the left tree.
    LeftOnly(PathBuf),
    /// Present only in the right tree.
    RightOnly(PathBuf),
    /// A file on one side, a directory on the other.
    Kind(PathBuf),
    /// Files with different size or bytes.
    Content(PathBuf),
}

impl Difference {
    /// Relative path the difference was found at.
    pub fn path(&self) -> &Path {
        match self {
            Difference::LeftOnly(p)
            | Difference::RightOnly(p)
            | Difference::Kind(p)
            | Difference::Content(p) => p,
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::LeftOnly(p) => write!(f, "only in source: {}", p.display()),
            Difference::RightOnly(p) => write!(f, "only in snapshot: {}", p.display()),
            Difference::Kind(p) => write!(f, "file/directory mismatch: {}", p.display()),
            Difference::Content(p) => write!(f, "content differs: {}", p.display()),
        }
    }
}

/// Whether the trees rooted at `a` and `b` differ.
///
/// Reflexive (`differs(a, a)` is false) and symmetric.
///
/// # Errors
/// - `NotFound` if either root is missing or not a directory
/// - `Io` if an entry cannot be read during the walk
pub fn differs(a: &Path, b: &Path) -> Result<bool> {
    Ok(first_difference(a, b)?.is_some())
}

/// Walk both trees and stop at the first difference.
///
/// Levels are visited depth-first, names in sorted order, so the reported
/// difference is deterministic.
pub fn first_difference(a: &Path, b: &Path) -> Result<Option<Difference>> {
    ensure_dir(a)?;
    ensure_dir(b)?;

    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let left = read_entries(&a.join(&rel))?;
        let right = read_entries(&b.join(&rel))?;

        if let Some(name) = left.keys().find(|name| !right.contains_key(*name)) {
            return Ok(Some(Difference::LeftOnly(rel.join(name))));
        }
        if let Some(name) = right.keys().find(|name| !left.contains_key(*name)) {
            return Ok(Some(Difference::RightOnly(rel.join(name))));
        }

        let mut subdirs = Vec::new();
        for (name, left_kind) in &left {
            let entry = rel.join(name);
            match (left_kind, right[name]) {
                (EntryKind::Dir, EntryKind::Dir) => subdirs.push(entry),
                (EntryKind::File(left_len), EntryKind::File(right_len)) => {
                    if *left_len != right_len
                        || !same_content(&a.join(&entry), &b.join(&entry))?
                    {
                        return Ok(Some(Difference::Content(entry)));
                    }
                }
                _ => return Ok(Some(Difference::Kind(entry))),
            }
        }

        // Reverse so the stack pops subdirectories in name order.
        pending.extend(subdirs.into_iter().rev());
    }

    Ok(None)
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "Directory not found: {}",
            path.display()
        )))
    }
}
